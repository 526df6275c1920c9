//! Run summaries: human-readable text for stdout and CSV rows appended to
//! result logs.
//!
//! CSV files gain a header only when they are new or empty, so repeated runs
//! accumulate rows in one table.

use super::stats::RunResult;
use super::throughput::{ThroughputPlan, ThroughputReport};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const THROUGHPUT_HEADER: &str =
    "engine,tokenizer,duration_s,batch_size,requests_sent,requests_succeeded,tokens_sent,elapsed_s,requests_per_sec,tokens_per_sec";

pub const LATENCY_HEADER: &str =
    "engine,tokenizer,max_batch_size,min_us,avg_us,max_us,p90_us,p99_us,samples,timeouts";

pub const CDF_HEADER: &str = "latency_us,fraction";

/// Report writing errors
#[derive(Debug, Error)]
#[error("failed to write '{}': {source}", .path.display())]
pub struct ReportError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

/// Free-form labels identifying what was benchmarked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLabels {
    pub engine: String,
    pub tokenizer: String,
}

pub fn latency_summary(labels: &RunLabels, result: &RunResult, show_series: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Latency ({} / {})", labels.engine, labels.tokenizer);
    let _ = writeln!(
        out,
        "{:>12} {:>12} {:>12} {:>12} {:>12}",
        "Min", "Avg", "Max", "P90", "P99"
    );
    let _ = writeln!(
        out,
        "{:>10.1}us {:>10.1}us {:>10.1}us {:>10.1}us {:>10.1}us",
        result.min(),
        result.mean(),
        result.max(),
        result.p90(),
        result.p99()
    );
    let _ = writeln!(
        out,
        "samples: {}  replies: {}  timeouts: {}",
        result.samples().len(),
        result.valid(),
        result.timeouts()
    );
    if let Some((first, last)) = result.window() {
        let _ = writeln!(
            out,
            "window: {} .. {}",
            first.format("%Y-%m-%d %H:%M:%S%.3f"),
            last.format("%H:%M:%S%.3f")
        );
    }

    if show_series {
        let _ = writeln!(out, "{:>10} {:>12}", "batch", "avg_us");
        for (batch, mean) in result.by_batch_size() {
            let _ = writeln!(out, "{batch:>10} {mean:>12.1}");
        }
    }
    out
}

pub fn throughput_summary(labels: &RunLabels, plan: &ThroughputPlan, report: &ThroughputReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Throughput ({} / {})", labels.engine, labels.tokenizer);
    let _ = writeln!(
        out,
        "duration: {:.1}s  batch: {}",
        plan.duration.as_secs_f64(),
        plan.batch
    );
    let _ = writeln!(
        out,
        "sent: {}  succeeded: {}  tokens: {}  elapsed: {:.3}s",
        report.requests_sent,
        report.requests_succeeded,
        report.tokens_sent,
        report.elapsed_secs()
    );
    let _ = writeln!(
        out,
        "requests/sec: {:.2}  tokens/sec: {:.2}",
        report.requests_per_sec(),
        report.tokens_per_sec()
    );
    out
}

pub fn throughput_row(labels: &RunLabels, plan: &ThroughputPlan, report: &ThroughputReport) -> String {
    format!(
        "{},{},{:.3},{},{},{},{},{:.3},{:.2},{:.2}",
        csv_field(&labels.engine),
        csv_field(&labels.tokenizer),
        plan.duration.as_secs_f64(),
        plan.batch,
        report.requests_sent,
        report.requests_succeeded,
        report.tokens_sent,
        report.elapsed_secs(),
        report.requests_per_sec(),
        report.tokens_per_sec(),
    )
}

pub fn latency_row(labels: &RunLabels, max_batch_size: u32, result: &RunResult) -> String {
    format!(
        "{},{},{},{:.2},{:.2},{:.2},{:.2},{:.2},{},{}",
        csv_field(&labels.engine),
        csv_field(&labels.tokenizer),
        max_batch_size,
        result.min(),
        result.mean(),
        result.max(),
        result.p90(),
        result.p99(),
        result.samples().len(),
        result.timeouts(),
    )
}

/// Append `row` to the CSV at `path`, writing `header` first if the file is
/// new or empty.
pub fn append_row(path: &Path, header: &str, row: &str) -> Result<(), ReportError> {
    let wrap = |source| ReportError {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)?;
    let empty = file.metadata().map_err(wrap)?.len() == 0;

    let mut out = String::with_capacity(header.len() + row.len() + 2);
    if empty {
        out.push_str(header);
        out.push('\n');
    }
    out.push_str(row);
    out.push('\n');
    file.write_all(out.as_bytes()).map_err(wrap)?;

    info!(path = %path.display(), "Appended result row");
    Ok(())
}

/// Write the latency CDF, replacing any previous file.
pub fn write_cdf(path: &Path, result: &RunResult) -> Result<(), ReportError> {
    let mut csv = String::new();
    csv.push_str(CDF_HEADER);
    csv.push('\n');
    for (us, fraction) in result.cdf() {
        let _ = writeln!(csv, "{us:.3},{fraction:.6}");
    }
    std::fs::write(path, csv).map_err(|source| ReportError {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), points = result.valid(), "Wrote latency CDF");
    Ok(())
}

/// Quote a field if it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
