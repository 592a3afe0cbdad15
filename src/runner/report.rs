use serde::{Deserialize, Serialize};

use crate::runner::context::{RunContext, TestRecord};
use crate::runner::result::Bucket;

/// Serializable test run result for emitter output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: RunMetadata,
    pub results: Vec<TestReport>,
    pub summary: SummaryReport,
    /// Why the run ended abnormally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata about the run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub root: String,
    pub files: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// A single test's result in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub status: Bucket,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// Error detail in the report. `kind` is absent for skip/warn reasons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
}

/// Summary statistics in the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
    pub success: bool,
}

impl SummaryReport {
    /// Fold another run's counts into this one, e.g. across repeated runs.
    pub fn add(&mut self, other: &SummaryReport) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.warnings += other.warnings;
        self.skipped += other.skipped;
        self.success = self.success && other.success;
    }
}

/// Convert a settled [`RunContext`] into a serializable [`RunReport`].
pub fn to_report(ctx: &RunContext) -> RunReport {
    let buckets = [
        (Bucket::Passed, ctx.passed()),
        (Bucket::Failed, ctx.failed()),
        (Bucket::Warnings, ctx.warnings()),
        (Bucket::Skipped, ctx.skipped()),
    ];
    let results = buckets
        .iter()
        .flat_map(|(bucket, records)| records.iter().map(move |r| test_report(*bucket, r)))
        .collect();

    RunReport {
        run: RunMetadata {
            root: ctx.root().display().to_string(),
            files: ctx.files().len(),
            duration_ms: ctx.duration().as_millis() as u64,
            seed: ctx.config().seed,
        },
        results,
        summary: SummaryReport {
            total: ctx.tests_run(),
            passed: ctx.passed().len(),
            failed: ctx.failed().len(),
            warnings: ctx.warnings().len(),
            skipped: ctx.skipped().len(),
            success: ctx.success(),
        },
        error: ctx.err().map(ToString::to_string),
    }
}

fn test_report(bucket: Bucket, record: &TestRecord) -> TestReport {
    TestReport {
        name: record.test.name.clone(),
        file: record.file.display().to_string(),
        line: record.test.line_number,
        status: bucket,
        tags: record.test.tags.iter().cloned().collect(),
        duration_ms: record.duration.map(|d| d.as_millis() as u64),
        error: record.err.as_ref().map(|message| ErrorReport {
            kind: record.kind.map(|k| k.to_string()),
            message: message.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use crate::runner::config::RunConfig;
    use crate::runner::context::FileInfo;
    use crate::runner::executor::RunError;
    use crate::runner::result::TestFailure;
    use crate::suite::TestDescriptor;

    fn make_context() -> RunContext {
        let config = RunConfig {
            root: Some(PathBuf::from("/")),
            seed: Some(9),
            ..RunConfig::default()
        };
        let mut ctx = RunContext::from_config(config).unwrap();
        let file = FileInfo::new(PathBuf::from("/w/a.tests.yaml"), Path::new("/w"));
        let mut tagged = TestDescriptor::new("login");
        tagged.tags.insert("qa".into());
        tagged.line_number = Some(12);
        ctx.record(
            Bucket::Passed,
            TestRecord::new(tagged, &file).with_duration(Duration::from_millis(250)),
        );
        ctx.record(
            Bucket::Failed,
            TestRecord::new(TestDescriptor::new("logout"), &file)
                .with_failure(&TestFailure::assertion("still logged in")),
        );
        ctx.record(
            Bucket::Skipped,
            TestRecord::new(TestDescriptor::new("later"), &file),
        );
        ctx
    }

    #[test]
    fn report_counts_and_order() {
        let report = to_report(&make_context());
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.skipped, 1);
        assert!(!report.summary.success);
        let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["login", "logout", "later"]);
        assert_eq!(report.run.seed, Some(9));
    }

    #[test]
    fn report_test_fields() {
        let report = to_report(&make_context());
        let login = &report.results[0];
        assert_eq!(login.file, "a.tests.yaml");
        assert_eq!(login.line, Some(12));
        assert_eq!(login.tags, vec!["qa"]);
        assert_eq!(login.duration_ms, Some(250));
        assert!(login.error.is_none());

        let logout = report.results[1].error.as_ref().unwrap();
        assert_eq!(logout.kind.as_deref(), Some("assertion failed"));
        assert_eq!(logout.message, "still logged in");
    }

    #[test]
    fn report_carries_run_error() {
        let mut ctx = make_context();
        ctx.set_err(RunError::FailFast);
        let report = to_report(&ctx);
        assert_eq!(
            report.error.as_deref(),
            Some("Run failed immediately since fail-fast is set")
        );
    }

    #[test]
    fn summary_add_folds_runs() {
        let mut total = SummaryReport {
            success: true,
            ..SummaryReport::default()
        };
        total.add(&to_report(&make_context()).summary);
        total.add(&to_report(&make_context()).summary);
        assert_eq!(total.total, 6);
        assert_eq!(total.failed, 2);
        assert!(!total.success);
    }
}
