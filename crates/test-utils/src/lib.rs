//! Shared test utilities for the stampede workspace.
//!
//! This crate provides common testing infrastructure including:
//! - A scripted in-memory [`MockTransport`]
//! - A local axum target server for end-to-end HTTP tests
//! - Scenario, outcome and run-context fixtures
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{fixtures, MockTransport};
//! ```

pub mod fixtures;
pub mod mock;
pub mod server;

pub use fixtures::*;
pub use mock::MockTransport;
pub use server::TargetServer;

/// Macro for approximate floating-point equality assertions.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(summary.error_rate, 0.25, 1e-9);
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`,\n right: `{:?}`,\n  diff: `{:?}` > epsilon `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_assert_approx_eq_passes() {
        assert_approx_eq!(0.1 + 0.2, 0.3, 1e-12);
        assert_approx_eq!(120.0, 119.5, 1.0);
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn test_assert_approx_eq_fails() {
        assert_approx_eq!(0.30, 0.25, 0.01);
    }
}
