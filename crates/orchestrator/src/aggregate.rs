//! Result aggregation

use testrun_common::{CaseResult, RunResult, RunStatus, Summary};

/// Terminal status plus the payload to persist
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: RunStatus,
    pub result: RunResult,
}

/// Fold case results into a run verdict.
///
/// The run passes iff every result passed, which holds vacuously when there
/// are none.
pub fn aggregate(
    api_results: Vec<CaseResult>,
    ui_results: Vec<CaseResult>,
    invalid_results: Vec<CaseResult>,
) -> Verdict {
    let all = || api_results.iter().chain(&ui_results).chain(&invalid_results);
    let summary = Summary::from_results(all());
    let cancelled = all().any(|r| r.cancelled);
    let status = if all().all(CaseResult::passed) {
        RunStatus::Passed
    } else {
        RunStatus::Failed
    };

    let result = RunResult {
        api_results,
        ui_results,
        invalid_results,
        summary,
        cancelled,
        ..Default::default()
    };

    Verdict { status, result }
}
