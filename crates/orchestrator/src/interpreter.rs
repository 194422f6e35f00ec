//! Step DSL interpreter
//!
//! Executes an already-validated step list against one page. Fails fast on
//! the first failing step; there is no retry. The cancellation token is
//! checked before every step and raced against every page call.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

use testrun_common::StepRecord;

use crate::artifacts::{ensure_parent, ArtifactLayout};
use crate::browser::Page;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::RunContext;
use crate::spec::StepAction;

/// Why a step sequence stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Assertion, timeout or browser action failure
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step {index} ({action}) failed: {message}")]
pub struct StepFailure {
    pub index: usize,
    pub action: String,
    pub message: String,
    pub kind: FailureKind,
}

/// Runs step lists
#[derive(Debug, Clone)]
pub struct StepInterpreter {
    layout: ArtifactLayout,
}

impl StepInterpreter {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    /// Execute `steps` in order, appending a record per completed step to `trace`.
    ///
    /// `trace` is filled incrementally so that callers abandoning the future
    /// (e.g. on a case timeout) still see how far the case got.
    pub async fn run(
        &self,
        ctx: &RunContext,
        case_id: i64,
        page: &dyn Page,
        steps: &[StepAction],
        base_url: &str,
        trace: &mut Vec<StepRecord>,
    ) -> Result<(), StepFailure> {
        for (index, step) in steps.iter().enumerate() {
            let failure = |kind, message: String| StepFailure {
                index,
                action: step.name(),
                message,
                kind,
            };

            if ctx.is_cancelled() {
                return Err(failure(FailureKind::Cancelled, "cancelled".to_string()));
            }

            debug!("Run {} case {} step {}: {}", ctx.run_id, case_id, index, step.name());
            let started = Instant::now();

            match self.execute_step(ctx, case_id, index, page, step, base_url).await {
                Ok(screenshot) => trace.push(StepRecord {
                    index,
                    name: step.name(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    screenshot,
                }),
                Err(OrchestratorError::Cancelled) => {
                    return Err(failure(FailureKind::Cancelled, "cancelled".to_string()))
                }
                Err(OrchestratorError::Assertion(message)) => {
                    return Err(failure(FailureKind::Failed, message))
                }
                Err(e) => return Err(failure(FailureKind::Failed, e.to_string())),
            }
        }

        Ok(())
    }

    async fn execute_step(
        &self,
        ctx: &RunContext,
        case_id: i64,
        index: usize,
        page: &dyn Page,
        step: &StepAction,
        base_url: &str,
    ) -> OrchestratorResult<Option<String>> {
        match step {
            StepAction::Navigate { path } => {
                guarded(ctx, page.goto(&resolve_url(base_url, path))).await?;
            }
            StepAction::Fill { selector, value } => {
                guarded(ctx, page.fill(selector, value)).await?;
            }
            StepAction::Click { selector } => {
                guarded(ctx, page.click(selector)).await?;
            }
            StepAction::Wait { ms } => {
                guarded(ctx, async {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(())
                })
                .await?;
            }
            StepAction::WaitForSelector { selector, timeout_ms } => {
                guarded(
                    ctx,
                    page.wait_for_selector(selector, Duration::from_millis(*timeout_ms)),
                )
                .await?;
            }
            StepAction::AssertText { selector, expected } => {
                let text = guarded(ctx, page.text_content(selector)).await?;
                if !text.contains(expected.as_str()) {
                    return Err(OrchestratorError::Assertion(format!(
                        "expected text of '{}' to contain '{}', got '{}'",
                        selector, expected, text
                    )));
                }
            }
            StepAction::AssertUrl { expected } => {
                let url = guarded(ctx, page.url()).await?;
                if !url.contains(expected.as_str()) {
                    return Err(OrchestratorError::Assertion(format!(
                        "expected URL to contain '{}', got '{}'",
                        expected, url
                    )));
                }
            }
            StepAction::Screenshot => {
                let path = self
                    .layout
                    .screenshot_path(ctx.run_id, case_id, &format!("step_{}", index));
                ensure_parent(&path).await?;
                guarded(ctx, page.screenshot(&path)).await?;
                return Ok(Some(path.to_string_lossy().into_owned()));
            }
        }
        Ok(None)
    }
}

/// Race `fut` against the run's cancellation token
async fn guarded<T>(
    ctx: &RunContext,
    fut: impl Future<Output = OrchestratorResult<T>>,
) -> OrchestratorResult<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(OrchestratorError::Cancelled),
        result = fut => result,
    }
}

/// Join a navigate target onto the base URL; absolute URLs pass through
fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}
