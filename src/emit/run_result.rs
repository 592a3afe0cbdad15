use serde::Serialize;

use crate::runner::report::RunReport;

/// Emit test run results as YAML.
pub fn emit_run_yaml(report: &RunReport) -> String {
    to_yaml(report)
}

/// Emit test run results as JSON.
pub fn emit_run_json(report: &RunReport) -> String {
    to_json(report)
}

/// Emit repeated runs as one YAML sequence.
pub fn emit_runs_yaml(reports: &[RunReport]) -> String {
    to_yaml(reports)
}

/// Emit repeated runs as one JSON array.
pub fn emit_runs_json(reports: &[RunReport]) -> String {
    to_json(reports)
}

fn to_yaml<T: Serialize + ?Sized>(value: &T) -> String {
    serde_yaml::to_string(value).unwrap_or_else(|e| format!("# Error serializing report: {e}"))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{ \"error\": \"{}\" }}", e))
}
