//! Execution coordinator
//!
//! The single writer of run state. `execute` takes a pending run to a
//! terminal state on every path: case failures, orchestration errors and
//! panics beneath it all end as a persisted `passed` or `failed` run, and
//! the run's registry entry is gone by the time `execute` returns.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

use testrun_common::{
    CaseDetails, CaseKind, CaseResult, CaseStatus, Environment, Error, Run, RunResult, RunStatus,
    RunStore, TestCase,
};

use crate::aggregate::aggregate;
use crate::api::ApiCaseExecutor;
use crate::browser::BrowserEngine;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;
use crate::http::HttpTransport;
use crate::registry::{ExecutionRegistry, RunContext};
use crate::report::{ReportGenerator, ReportTool};
use crate::ui::UiCaseExecutor;

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The run's cancellation signal was fired
    Signalled,
    /// The run is not in `running`; nothing to stop
    NotRunning { status: RunStatus },
    /// The run is `running` but not executing in this process
    NotRegistered,
}

/// External collaborators the coordinator drives
pub struct Collaborators {
    pub store: Arc<dyn RunStore>,
    pub transport: Arc<dyn HttpTransport>,
    pub browser: Arc<dyn BrowserEngine>,
    pub report_tool: Arc<dyn ReportTool>,
}

pub struct Coordinator {
    store: Arc<dyn RunStore>,
    registry: Arc<ExecutionRegistry>,
    api: ApiCaseExecutor,
    ui: UiCaseExecutor,
    reports: ReportGenerator,
}

/// What the run body decided
struct Outcome {
    status: RunStatus,
    result: RunResult,
    report_path: Option<String>,
}

impl Coordinator {
    pub fn new(config: &OrchestratorConfig, collaborators: Collaborators) -> Self {
        Self::with_registry(config, collaborators, Arc::new(ExecutionRegistry::new()))
    }

    pub fn with_registry(
        config: &OrchestratorConfig,
        collaborators: Collaborators,
        registry: Arc<ExecutionRegistry>,
    ) -> Self {
        Self {
            store: collaborators.store,
            registry,
            api: ApiCaseExecutor::new(collaborators.transport, config),
            ui: UiCaseExecutor::new(collaborators.browser, config),
            reports: ReportGenerator::new(collaborators.report_tool, config),
        }
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Execute a pending run, optionally restricted to `case_filter`.
    ///
    /// Fails without touching the run if it does not exist, is not pending,
    /// or is already executing here. Otherwise returns the run in its
    /// terminal state.
    pub async fn execute(&self, run_id: i64, case_filter: Option<&[i64]>) -> OrchestratorResult<Run> {
        let mut run = self
            .store
            .load_run(run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        if run.status != RunStatus::Pending {
            return Err(Error::InvalidStateTransition {
                from: run.status.to_string(),
                to: RunStatus::Running.to_string(),
            }
            .into());
        }

        let registration = self.registry.register(run_id)?;
        run.start()?;
        self.store.save_run(&run)?;
        info!("Run {} started (project {})", run_id, run.project_id);

        let ctx = registration.context();
        let body = AssertUnwindSafe(self.run_body(&ctx, &run, case_filter))
            .catch_unwind()
            .await;

        let mut outcome = match body {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!("Run {} failed: {}", run_id, e);
                Outcome {
                    status: RunStatus::Failed,
                    result: RunResult::from_error(e.to_string()),
                    report_path: None,
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Run {} panicked: {}", run_id, message);
                Outcome {
                    status: RunStatus::Failed,
                    result: RunResult::from_error(format!("internal error: {}", message)),
                    report_path: None,
                }
            }
        };

        // A stop that lands after the last case still ends the run
        if ctx.is_cancelled() && !outcome.result.cancelled {
            info!("Run {} stopped after case dispatch", run_id);
            outcome.status = RunStatus::Failed;
            outcome.result.cancelled = true;
        }

        run.finish(outcome.status, outcome.result, outcome.report_path)?;
        let saved = self.store.save_run(&run);
        drop(registration);

        if let Err(e) = &saved {
            error!("Run {}: failed to persist terminal state: {}", run_id, e);
        }
        saved?;

        let summary = run.result.as_ref().map(|r| r.summary).unwrap_or_default();
        info!(
            "Run {} {}: {} total, {} passed, {} failed, {} error",
            run_id, run.status, summary.total, summary.passed, summary.failed, summary.error
        );
        Ok(run)
    }

    async fn run_body(
        &self,
        ctx: &RunContext,
        run: &Run,
        case_filter: Option<&[i64]>,
    ) -> OrchestratorResult<Outcome> {
        let environment: Environment = self
            .store
            .load_environment(run.environment_id)?
            .ok_or_else(|| Error::not_found("environment", run.environment_id))?;
        let cases = self.store.load_cases(run.project_id, case_filter)?;

        let (api_cases, ui_cases, invalid_results) = partition(cases);
        info!(
            "Run {}: {} API, {} UI, {} unrecognized cases",
            run.id,
            api_cases.len(),
            ui_cases.len(),
            invalid_results.len()
        );

        let (api_results, ui_results) = tokio::join!(
            self.api.execute(ctx, &api_cases, &environment),
            self.ui.execute(ctx, &ui_cases, &environment),
        );

        let verdict = aggregate(api_results, ui_results, invalid_results);
        if verdict.result.cancelled {
            info!("Run {} cancelled", run.id);
        }

        let report_path = self
            .reports
            .generate(ctx, run.id, &environment, &verdict.result)
            .await;

        Ok(Outcome {
            status: verdict.status,
            result: verdict.result,
            report_path,
        })
    }

    /// Request cancellation of a running run
    pub fn stop(&self, run_id: i64) -> OrchestratorResult<StopOutcome> {
        let run = self
            .store
            .load_run(run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        if run.status != RunStatus::Running {
            return Ok(StopOutcome::NotRunning { status: run.status });
        }

        if self.registry.cancel(run_id) {
            Ok(StopOutcome::Signalled)
        } else {
            warn!("Run {} is running but not registered here", run_id);
            Ok(StopOutcome::NotRegistered)
        }
    }
}

/// Split cases by kind, turning unrecognized kinds into `error` results
fn partition(cases: Vec<TestCase>) -> (Vec<TestCase>, Vec<TestCase>, Vec<CaseResult>) {
    let mut api = Vec::new();
    let mut ui = Vec::new();
    let mut invalid = Vec::new();

    for case in cases {
        match case.classify() {
            Some(CaseKind::Api) => api.push(case),
            Some(CaseKind::Ui) => ui.push(case),
            None => {
                let result = CaseResult::new(
                    &case,
                    CaseStatus::Error,
                    CaseDetails::Invalid {
                        kind: case.kind.clone(),
                    },
                )
                .with_error(format!("validation error: unsupported case kind '{}'", case.kind));
                invalid.push(result);
            }
        }
    }

    (api, ui, invalid)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
