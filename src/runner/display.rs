use crate::runner::context::{RunContext, TestRecord};
use crate::runner::report::SummaryReport;
use crate::runner::result::Bucket;

/// Format a status label for terminal output.
fn status_label(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::Passed => "PASSED",
        Bucket::Failed => "FAILED",
        Bucket::Warnings => "WARNING",
        Bucket::Skipped => "SKIPPED",
    }
}

/// Format a settled test. Verbose output adds `file:line` and the duration.
pub fn format_result(record: &TestRecord, bucket: Bucket, verbose: bool) -> String {
    let status = status_label(bucket);
    let mut line = format!("  [{status}] {}", record.test.name);

    if verbose {
        match record.test.line_number {
            Some(n) => line.push_str(&format!(" {}:{n}", record.file.display())),
            None => line.push_str(&format!(" {}", record.file.display())),
        }
        if let Some(duration) = record.duration {
            line.push_str(&format!(" ({:.1}s)", duration.as_secs_f64()));
        }
    }

    if let Some(err) = &record.err {
        line.push_str(&format!("\n         → {err}"));
    }

    line
}

/// Format every settled test, failures last so they stay on screen.
pub fn format_results(ctx: &RunContext, verbose: bool) -> Vec<String> {
    let buckets = [
        (Bucket::Passed, ctx.passed()),
        (Bucket::Skipped, ctx.skipped()),
        (Bucket::Warnings, ctx.warnings()),
        (Bucket::Failed, ctx.failed()),
    ];
    buckets
        .iter()
        .flat_map(|(bucket, records)| records.iter().map(move |r| format_result(r, *bucket, verbose)))
        .collect()
}

/// Format the final summary after all tests settle.
pub fn format_summary(summary: &SummaryReport, duration_secs: f64) -> String {
    let mut parts = Vec::new();

    if summary.passed > 0 {
        parts.push(format!("{} passed", summary.passed));
    }
    if summary.failed > 0 {
        parts.push(format!("{} failed", summary.failed));
    }
    if summary.warnings > 0 {
        parts.push(format!("{} warnings", summary.warnings));
    }
    if summary.skipped > 0 {
        parts.push(format!("{} skipped", summary.skipped));
    }

    if parts.is_empty() {
        parts.push("0 tests".into());
    }

    format!("\nResults: {} ({:.1}s)", parts.join(", "), duration_secs)
}

/// Format the run header line.
pub fn format_run_header(files: usize, workers: usize) -> String {
    let noun = if files == 1 { "file" } else { "files" };
    format!("Running {files} test {noun} on {workers} workers...\n")
}
