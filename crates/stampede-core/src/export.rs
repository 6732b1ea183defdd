//! CSV export using locust's file layout and column names.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::aggregator::{RunSummary, StatsRow, PERCENTILES};
use crate::error::{LoadError, LoadResult};
use crate::history::History;

/// Type column value for per-tag rows.
pub const TAG_ROW_TYPE: &str = "tag";

fn percentile_headers() -> Vec<String> {
    PERCENTILES
        .iter()
        .map(|q| {
            let pct = format!("{:.2}", q * 100.0);
            format!("{}%", pct.trim_end_matches('0').trim_end_matches('.'))
        })
        .collect()
}

fn fmt_ms(v: f64) -> String {
    format!("{:.0}", v)
}

fn fmt_rate(v: f64) -> String {
    format!("{:.6}", v)
}

fn stats_record(kind: &str, row: &StatsRow) -> Vec<String> {
    let mut record = vec![
        kind.to_string(),
        row.name.clone(),
        row.requests.to_string(),
        row.failures.to_string(),
        fmt_ms(row.median_ms),
        format!("{:.3}", row.avg_ms),
        format!("{:.3}", row.min_ms),
        format!("{:.3}", row.max_ms),
        format!("{:.1}", row.avg_bytes),
        fmt_rate(row.rps),
        fmt_rate(row.failures_per_sec),
    ];
    record.extend(row.percentiles_ms.iter().map(|&v| fmt_ms(v)));
    record
}

/// Per-request rows, then per-tag rows, then the `Aggregated` total.
pub fn write_stats<W: Write>(writer: W, summary: &RunSummary) -> LoadResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    let mut header: Vec<String> = [
        "Type",
        "Name",
        "Request Count",
        "Failure Count",
        "Median Response Time",
        "Average Response Time",
        "Min Response Time",
        "Max Response Time",
        "Average Content Size",
        "Requests/s",
        "Failures/s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(percentile_headers());
    csv.write_record(&header)?;

    for row in &summary.requests {
        csv.write_record(stats_record(&row.method, row))?;
    }
    for row in &summary.tags {
        csv.write_record(stats_record(TAG_ROW_TYPE, row))?;
    }
    csv.write_record(stats_record("", &summary.total))?;
    csv.flush()?;
    Ok(())
}

pub fn write_history<W: Write>(writer: W, history: &History) -> LoadResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    let mut header: Vec<String> = ["Timestamp", "User Count", "Type", "Name", "Requests/s", "Failures/s"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(percentile_headers());
    header.extend(
        [
            "Total Request Count",
            "Total Failure Count",
            "Total Median Response Time",
            "Total Average Response Time",
            "Total Min Response Time",
            "Total Max Response Time",
            "Total Average Content Size",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    csv.write_record(&header)?;

    for row in history.rows() {
        let mut record = vec![
            row.timestamp.timestamp().to_string(),
            row.user_count.to_string(),
            String::new(),
            "Aggregated".to_string(),
            fmt_rate(row.current_rps),
            fmt_rate(row.current_failures_per_sec),
        ];
        if row.total_requests == 0 {
            record.extend(PERCENTILES.iter().map(|_| "N/A".to_string()));
        } else {
            record.extend(row.percentiles_ms.iter().map(|&v| fmt_ms(v)));
        }
        record.extend([
            row.total_requests.to_string(),
            row.total_failures.to_string(),
            fmt_ms(row.median_ms),
            format!("{:.3}", row.avg_ms),
            format!("{:.3}", row.min_ms),
            format!("{:.3}", row.max_ms),
            format!("{:.1}", row.avg_bytes),
        ]);
        csv.write_record(&record)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_failures<W: Write>(writer: W, summary: &RunSummary) -> LoadResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["Method", "Name", "Error", "Occurrences"])?;
    for row in &summary.failures {
        let occurrences = row.occurrences.to_string();
        csv.write_record([
            row.method.as_str(),
            row.name.as_str(),
            row.error.as_str(),
            occurrences.as_str(),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_exceptions<W: Write>(writer: W, summary: &RunSummary) -> LoadResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["Count", "Message", "Names"])?;
    for row in &summary.exceptions {
        csv.write_record([
            row.count.to_string(),
            row.message.clone(),
            row.names.join(" "),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

fn create(path: &Path) -> LoadResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    File::create(path).map_err(|e| LoadError::Export(format!("{}: {}", path.display(), e)))
}

/// Write `<prefix>_stats.csv`, `<prefix>_stats_history.csv`,
/// `<prefix>_failures.csv` and `<prefix>_exceptions.csv`.
pub fn export_csv(prefix: &str, summary: &RunSummary, history: &History) -> LoadResult<Vec<PathBuf>> {
    let path = |suffix: &str| PathBuf::from(format!("{}_{}.csv", prefix, suffix));

    let stats = path("stats");
    write_stats(create(&stats)?, summary)?;
    let history_path = path("stats_history");
    write_history(create(&history_path)?, history)?;
    let failures = path("failures");
    write_failures(create(&failures)?, summary)?;
    let exceptions = path("exceptions");
    write_exceptions(create(&exceptions)?, summary)?;

    let written = vec![stats, history_path, failures, exceptions];
    info!(prefix, files = written.len(), "Exported CSV results");
    Ok(written)
}
