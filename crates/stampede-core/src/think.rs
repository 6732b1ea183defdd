//! Think time between a virtual user's successive actions.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};

/// How long a user pauses after finishing an action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkTime {
    /// Always wait the same number of seconds.
    Constant { secs: f64 },
    /// Uniformly random wait in `[min, max]` seconds.
    Between { min: f64, max: f64 },
    /// Keep iterations `secs` apart start-to-start; an action that took
    /// longer than the period is followed by no wait at all.
    ConstantPacing { secs: f64 },
}

impl Default for ThinkTime {
    fn default() -> Self {
        ThinkTime::Between { min: 1.0, max: 3.0 }
    }
}

impl ThinkTime {
    pub fn between(min: f64, max: f64) -> Self {
        ThinkTime::Between { min, max }
    }

    pub fn constant(secs: f64) -> Self {
        ThinkTime::Constant { secs }
    }

    pub fn validate(&self) -> LoadResult<()> {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        match *self {
            ThinkTime::Constant { secs } | ThinkTime::ConstantPacing { secs } if !ok(secs) => Err(
                LoadError::invalid_param("think_time", format!("{} is not a valid duration", secs)),
            ),
            ThinkTime::Between { min, max } if !ok(min) || !ok(max) || min > max => {
                Err(LoadError::invalid_param(
                    "think_time",
                    format!("between({}, {}) is not a valid range", min, max),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Wait before the next action, given how long the finished iteration took.
    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R, iteration: Duration) -> Duration {
        match *self {
            ThinkTime::Constant { secs } => Duration::from_secs_f64(secs),
            ThinkTime::Between { min, max } => {
                if max > min {
                    Duration::from_secs_f64(rng.gen_range(min..=max))
                } else {
                    Duration::from_secs_f64(min)
                }
            }
            ThinkTime::ConstantPacing { secs } => {
                Duration::from_secs_f64(secs).saturating_sub(iteration)
            }
        }
    }
}
