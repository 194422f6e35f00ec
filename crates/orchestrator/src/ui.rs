//! UI case executor
//!
//! One browser session and one context per call; a fresh page per case.
//! The executor is the only owner of the session and context and closes each
//! exactly once, including when the per-case loop panics.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use testrun_common::{CaseDetails, CaseResult, CaseStatus, Environment, StepRecord, TestCase};

use crate::artifacts::{ensure_parent, ArtifactLayout};
use crate::browser::{BrowserContext, BrowserEngine, Page};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::interpreter::{FailureKind, StepInterpreter};
use crate::registry::RunContext;
use crate::spec::parse_steps;

/// Ceiling on housekeeping calls (page close, failure screenshot)
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UiCaseExecutor {
    engine: Arc<dyn BrowserEngine>,
    interpreter: StepInterpreter,
    layout: ArtifactLayout,
    case_timeout: Duration,
    default_base_url: String,
}

impl UiCaseExecutor {
    pub fn new(engine: Arc<dyn BrowserEngine>, config: &OrchestratorConfig) -> Self {
        let layout = ArtifactLayout::new(config.artifacts.clone());
        Self {
            engine,
            interpreter: StepInterpreter::new(layout.clone()),
            layout,
            case_timeout: config.case_timeout(),
            default_base_url: config.default_ui_base_url.clone(),
        }
    }

    /// Run `cases` in order against `environment`.
    ///
    /// Returns one result per dispatched case, in input order. A stop request
    /// ends dispatch after the current case, which is recorded as cancelled.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        cases: &[TestCase],
        environment: &Environment,
    ) -> Vec<CaseResult> {
        if cases.is_empty() {
            return Vec::new();
        }
        let base_url = environment.base_url_or(&self.default_base_url).to_string();

        if ctx.is_cancelled() {
            return vec![ui_result(&cases[0], CaseStatus::Error, Vec::new(), None, None).cancelled()];
        }

        let session = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(OrchestratorError::Cancelled),
            session = self.engine.launch() => session,
        };
        let session = match session {
            Ok(session) => session,
            Err(OrchestratorError::Cancelled) => {
                return vec![ui_result(&cases[0], CaseStatus::Error, Vec::new(), None, None).cancelled()];
            }
            Err(e) => {
                error!("Run {}: browser launch failed: {}", ctx.run_id, e);
                return setup_failed(cases, &format!("browser launch failed: {}", e));
            }
        };

        let context = match session.new_context().await {
            Ok(context) => context,
            Err(e) => {
                error!("Run {}: browser context failed: {}", ctx.run_id, e);
                close_session(ctx, session.as_ref()).await;
                return setup_failed(cases, &format!("browser context failed: {}", e));
            }
        };

        let outcome = AssertUnwindSafe(self.run_cases(ctx, context.as_ref(), cases, &base_url))
            .catch_unwind()
            .await;

        if let Err(e) = context.close().await {
            warn!("Run {}: failed to close browser context: {}", ctx.run_id, e);
        }
        close_session(ctx, session.as_ref()).await;

        match outcome {
            Ok(results) => results,
            // Browser resources are released; let the coordinator record the fault
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run_cases(
        &self,
        ctx: &RunContext,
        context: &dyn BrowserContext,
        cases: &[TestCase],
        base_url: &str,
    ) -> Vec<CaseResult> {
        let mut results = Vec::with_capacity(cases.len());
        for case in cases {
            if ctx.is_cancelled() {
                info!("Run {}: cancelled before UI case {}", ctx.run_id, case.id);
                results.push(ui_result(case, CaseStatus::Error, Vec::new(), None, None).cancelled());
                break;
            }

            let result = self.run_case(ctx, context, case, base_url).await;
            info!(
                "Run {}: UI case {} ({}) {}",
                ctx.run_id, case.id, case.name, result.status
            );
            let stop = result.cancelled;
            results.push(result);
            if stop {
                break;
            }
        }
        results
    }

    async fn run_case(
        &self,
        ctx: &RunContext,
        context: &dyn BrowserContext,
        case: &TestCase,
        base_url: &str,
    ) -> CaseResult {
        let started = Instant::now();

        let steps = match parse_steps(&case.test_data) {
            Ok(steps) => steps,
            Err(e) => {
                return ui_result(case, CaseStatus::Error, Vec::new(), e.index, None)
                    .with_error(format!("validation error: {}", e));
            }
        };

        let page = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(OrchestratorError::Cancelled),
            page = context.new_page() => page,
        };
        let page = match page {
            Ok(page) => page,
            Err(OrchestratorError::Cancelled) => {
                return ui_result(case, CaseStatus::Error, Vec::new(), None, None).cancelled();
            }
            Err(e) => {
                return ui_result(case, CaseStatus::Error, Vec::new(), None, None)
                    .with_error(format!("failed to open page: {}", e))
                    .with_duration_ms(elapsed_ms(started));
            }
        };

        let mut trace: Vec<StepRecord> = Vec::new();
        let outcome = tokio::time::timeout(
            self.case_timeout,
            self.interpreter
                .run(ctx, case.id, page.as_ref(), &steps, base_url, &mut trace),
        )
        .await;

        let result = match outcome {
            Ok(Ok(())) => ui_result(case, CaseStatus::Passed, trace, None, None),
            Ok(Err(failure)) => match failure.kind {
                FailureKind::Cancelled => {
                    ui_result(case, CaseStatus::Error, trace, Some(failure.index), None).cancelled()
                }
                FailureKind::Failed => {
                    let screenshot = self.capture_failure(ctx, case.id, page.as_ref()).await;
                    ui_result(case, CaseStatus::Failed, trace, Some(failure.index), screenshot)
                        .with_error(failure.to_string())
                }
            },
            Err(_) => {
                let failed_step = trace.len();
                let screenshot = self.capture_failure(ctx, case.id, page.as_ref()).await;
                ui_result(case, CaseStatus::Failed, trace, Some(failed_step), screenshot).with_error(
                    format!("case timed out after {}s", self.case_timeout.as_secs()),
                )
            }
        };

        match tokio::time::timeout(CLEANUP_TIMEOUT, page.close()).await {
            Ok(Ok(())) => debug!("Run {}: closed page for case {}", ctx.run_id, case.id),
            Ok(Err(e)) => warn!("Run {}: failed to close page for case {}: {}", ctx.run_id, case.id, e),
            Err(_) => warn!("Run {}: timed out closing page for case {}", ctx.run_id, case.id),
        }

        result.with_duration_ms(elapsed_ms(started))
    }

    /// Screenshot the page state after a failure; `None` if that fails too
    async fn capture_failure(&self, ctx: &RunContext, case_id: i64, page: &dyn Page) -> Option<String> {
        let path = self.layout.screenshot_path(ctx.run_id, case_id, "error");
        if let Err(e) = ensure_parent(&path).await {
            warn!("Run {}: cannot create screenshot dir: {}", ctx.run_id, e);
            return None;
        }
        match tokio::time::timeout(CLEANUP_TIMEOUT, page.screenshot(&path)).await {
            Ok(Ok(())) => Some(path.to_string_lossy().into_owned()),
            Ok(Err(e)) => {
                warn!("Run {}: failure screenshot for case {} failed: {}", ctx.run_id, case_id, e);
                None
            }
            Err(_) => {
                warn!("Run {}: failure screenshot for case {} timed out", ctx.run_id, case_id);
                None
            }
        }
    }
}

async fn close_session(ctx: &RunContext, session: &dyn crate::browser::BrowserSession) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, session.close()).await {
        Ok(Ok(())) => debug!("Run {}: browser closed", ctx.run_id),
        Ok(Err(e)) => warn!("Run {}: failed to close browser: {}", ctx.run_id, e),
        Err(_) => warn!("Run {}: timed out closing browser", ctx.run_id),
    }
}

fn ui_result(
    case: &TestCase,
    status: CaseStatus,
    steps: Vec<StepRecord>,
    failed_step: Option<usize>,
    screenshot: Option<String>,
) -> CaseResult {
    CaseResult::new(
        case,
        status,
        CaseDetails::Ui {
            steps,
            failed_step,
            screenshot,
        },
    )
}

fn setup_failed(cases: &[TestCase], message: &str) -> Vec<CaseResult> {
    cases
        .iter()
        .map(|case| ui_result(case, CaseStatus::Error, Vec::new(), None, None).with_error(message))
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
