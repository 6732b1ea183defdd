//! Results reporting and the post-run threshold gate.

use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::Serialize;
use stampede_core::{RunSummary, StatsRow, StopReport};

use crate::config::Thresholds;

/// Outcome of comparing a summary against the configured thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdVerdict {
    pub passed: bool,
    pub violations: Vec<String>,
}

impl ThresholdVerdict {
    pub fn exit_code(&self) -> u8 {
        if self.passed {
            0
        } else {
            1
        }
    }
}

/// Apply thresholds to a finished run. Without `max_error_rate` any failed
/// request fails the run.
pub fn evaluate(summary: &RunSummary, thresholds: &Thresholds) -> ThresholdVerdict {
    let mut violations = Vec::new();

    match thresholds.max_error_rate {
        Some(max) if summary.error_rate > max => violations.push(format!(
            "error rate {:.2}% exceeds {:.2}%",
            summary.error_rate * 100.0,
            max * 100.0
        )),
        None if summary.total.failures > 0 => violations.push(format!(
            "{} of {} requests failed",
            summary.total.failures, summary.total.requests
        )),
        _ => {}
    }
    if let Some(max) = thresholds.max_p95_ms {
        if summary.p95_ms > max {
            violations.push(format!("p95 {:.0}ms exceeds {:.0}ms", summary.p95_ms, max));
        }
    }
    if let Some(max) = thresholds.max_p99_ms {
        if summary.p99_ms > max {
            violations.push(format!("p99 {:.0}ms exceeds {:.0}ms", summary.p99_ms, max));
        }
    }

    ThresholdVerdict {
        passed: violations.is_empty(),
        violations,
    }
}

/// Everything printed for `--output json`.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub summary: &'a RunSummary,
    pub stop: &'a StopReport,
    pub verdict: &'a ThresholdVerdict,
}

/// Formats run results for output.
pub struct ResultsReport;

impl ResultsReport {
    /// Per-request statistics, one row per request name plus the total.
    pub fn format_requests(summary: &RunSummary) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                "Type", "Name", "# reqs", "# fails", "Avg", "Min", "Max", "Med", "p95", "p99",
                "req/s", "failures/s",
            ]);

        for row in summary.requests.iter().chain(std::iter::once(&summary.total)) {
            table.add_row(stats_cells(row));
        }
        table.to_string()
    }

    /// Per-tag statistics; empty when no action declared tags.
    pub fn format_tags(summary: &RunSummary) -> Option<String> {
        if summary.tags.is_empty() {
            return None;
        }
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Tag", "# reqs", "# fails", "Med", "p95", "p99", "req/s"]);
        for row in &summary.tags {
            table.add_row(vec![
                row.name.clone(),
                row.requests.to_string(),
                format!("{}({:.2}%)", row.failures, fail_pct(row)),
                format!("{:.0}", row.median_ms),
                format!("{:.0}", row.p95_ms),
                format!("{:.0}", row.p99_ms),
                format!("{:.2}", row.rps),
            ]);
        }
        Some(table.to_string())
    }

    /// Error groups, most frequent first.
    pub fn format_failures(summary: &RunSummary) -> Option<String> {
        if summary.failures.is_empty() {
            return None;
        }
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["# occurrences", "Method", "Name", "Error"]);
        let mut failures: Vec<_> = summary.failures.iter().collect();
        failures.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        for f in failures {
            table.add_row(vec![
                f.occurrences.to_string(),
                f.method.clone(),
                f.name.clone(),
                f.error.clone(),
            ]);
        }
        Some(table.to_string())
    }

    /// Run totals, shutdown details and the verdict.
    pub fn format_summary(
        summary: &RunSummary,
        stop: &StopReport,
        verdict: &ThresholdVerdict,
    ) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Load Test Results", ""]);

        table.add_row(vec!["Duration:", &format!("{:.1}s", stop.elapsed.as_secs_f64())]);
        table.add_row(vec!["Total Requests:", &summary.total.requests.to_string()]);
        table.add_row(vec![
            "Error Rate:",
            &format!("{:.2}%", summary.error_rate * 100.0),
        ]);
        table.add_row(vec!["Requests/sec:", &format!("{:.1}", summary.throughput)]);
        table.add_row(vec!["", ""]);
        table.add_row(vec!["Latency (ms)", "p50 / p95 / p99 / max"]);
        table.add_row(vec![
            "",
            &format!(
                "{:.1} / {:.1} / {:.1} / {:.1}",
                summary.p50_ms, summary.p95_ms, summary.p99_ms, summary.total.max_ms
            ),
        ]);
        table.add_row(vec!["", ""]);
        table.add_row(vec![
            "Users:",
            &format!("{} spawned, {} peak", stop.users_spawned, stop.peak_users),
        ]);
        table.add_row(vec!["Iterations:", &stop.iterations.to_string()]);
        table.add_row(vec!["Stop:", &stop_label(stop)]);
        if stop.cancelled_requests > 0 {
            table.add_row(vec!["Cancelled:", &stop.cancelled_requests.to_string()]);
        }
        if summary.clamped_samples > 0 {
            table.add_row(vec!["Clamped samples:", &summary.clamped_samples.to_string()]);
        }
        if summary.overflowed_requests > 0 {
            table.add_row(vec![
                "Overflowed names:",
                &summary.overflowed_requests.to_string(),
            ]);
        }
        if summary.overflowed_failures > 0 {
            table.add_row(vec![
                "Overflowed failures:",
                &summary.overflowed_failures.to_string(),
            ]);
        }
        table.add_row(vec!["", ""]);
        let result = if verdict.passed {
            "PASS".to_string()
        } else {
            format!("FAIL: {}", verdict.violations.join("; "))
        };
        table.add_row(vec!["Result:", &result]);

        table.to_string()
    }

    /// Format results as JSON.
    pub fn format_json(
        summary: &RunSummary,
        stop: &StopReport,
        verdict: &ThresholdVerdict,
    ) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&RunReport {
            summary,
            stop,
            verdict,
        })?)
    }
}

fn stats_cells(row: &StatsRow) -> Vec<String> {
    vec![
        row.method.clone(),
        row.name.clone(),
        row.requests.to_string(),
        format!("{}({:.2}%)", row.failures, fail_pct(row)),
        format!("{:.0}", row.avg_ms),
        format!("{:.0}", row.min_ms),
        format!("{:.0}", row.max_ms),
        format!("{:.0}", row.median_ms),
        format!("{:.0}", row.p95_ms),
        format!("{:.0}", row.p99_ms),
        format!("{:.2}", row.rps),
        format!("{:.2}", row.failures_per_sec),
    ]
}

fn fail_pct(row: &StatsRow) -> f64 {
    if row.requests == 0 {
        0.0
    } else {
        row.failures as f64 / row.requests as f64 * 100.0
    }
}

fn stop_label(stop: &StopReport) -> String {
    let reason = match stop.reason {
        stampede_core::StopReason::DurationElapsed => "run time elapsed",
        stampede_core::StopReason::Stopped => "stopped",
        stampede_core::StopReason::Cancelled => "cancelled",
    };
    if stop.escalated {
        format!("{} (escalated to hard stop)", reason)
    } else {
        reason.to_string()
    }
}
