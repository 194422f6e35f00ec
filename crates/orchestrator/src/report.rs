//! Report generation
//!
//! Case results are written as Allure raw result files under the run's
//! results directory, then rendered by the report tool into the run's report
//! directory. Nothing here can change a run's verdict; any failure just
//! leaves the run without a report.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};
use uuid::Uuid;

use testrun_common::{CaseDetails, CaseResult, CaseStatus, Environment, RunResult};

use crate::artifacts::ArtifactLayout;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::RunContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Allure command line executable
    pub allure_binary: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            allure_binary: "allure".to_string(),
        }
    }
}

/// Renders a directory of raw results into a browsable report
#[async_trait]
pub trait ReportTool: Send + Sync {
    /// Render `raw_dir` into `out_dir`, returning the report location
    async fn generate(&self, raw_dir: &Path, out_dir: &Path) -> OrchestratorResult<PathBuf>;
}

/// [`ReportTool`] that shells out to `allure generate`
pub struct AllureCli {
    binary: String,
    timeout: Duration,
}

impl AllureCli {
    pub fn new(config: &ReportConfig, timeout: Duration) -> Self {
        Self {
            binary: config.allure_binary.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl ReportTool for AllureCli {
    async fn generate(&self, raw_dir: &Path, out_dir: &Path) -> OrchestratorResult<PathBuf> {
        debug!("{} generate {} -o {}", self.binary, raw_dir.display(), out_dir.display());

        let child = TokioCommand::new(&self.binary)
            .arg("generate")
            .arg(raw_dir)
            .arg("-o")
            .arg(out_dir)
            .arg("--clean")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OrchestratorError::Report(format!("'{}' not found", self.binary))
                } else {
                    OrchestratorError::Io(e)
                }
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OrchestratorError::Timeout(self.timeout.as_millis() as u64))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::Report(format!(
                "allure exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(out_dir.to_path_buf())
    }
}

// ============================================================================
// Allure raw result format
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllureResult {
    uuid: String,
    history_id: String,
    name: String,
    full_name: String,
    status: &'static str,
    status_details: AllureStatusDetails,
    stage: &'static str,
    start: i64,
    stop: i64,
    labels: Vec<AllureLabel>,
    steps: Vec<AllureStep>,
    attachments: Vec<AllureAttachment>,
}

#[derive(Debug, Default, Serialize)]
struct AllureStatusDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<String>,
}

#[derive(Debug, Serialize)]
struct AllureLabel {
    name: &'static str,
    value: String,
}

#[derive(Debug, Serialize)]
struct AllureStep {
    name: String,
    status: &'static str,
    stage: &'static str,
    start: i64,
    stop: i64,
    attachments: Vec<AllureAttachment>,
}

#[derive(Debug, Serialize)]
struct AllureAttachment {
    name: String,
    source: String,
    #[serde(rename = "type")]
    mime: &'static str,
}

fn allure_status(status: CaseStatus) -> &'static str {
    match status {
        CaseStatus::Passed => "passed",
        CaseStatus::Failed => "failed",
        CaseStatus::Error => "broken",
    }
}

/// Writes raw results and drives the [`ReportTool`]
pub struct ReportGenerator {
    tool: Arc<dyn ReportTool>,
    layout: ArtifactLayout,
}

impl ReportGenerator {
    pub fn new(tool: Arc<dyn ReportTool>, config: &OrchestratorConfig) -> Self {
        Self {
            tool,
            layout: ArtifactLayout::new(config.artifacts.clone()),
        }
    }

    /// Produce the run's report. Returns its location, or `None` on any failure.
    ///
    /// A run that is already cancelled still gets a report for the results it
    /// has; a stop arriving while the tool runs abandons the report.
    pub async fn generate(
        &self,
        ctx: &RunContext,
        run_id: i64,
        environment: &Environment,
        result: &RunResult,
    ) -> Option<String> {
        let raw_dir = self.layout.results_dir(run_id);
        let out_dir = self.layout.report_dir(run_id);

        if let Err(e) = write_raw_results(&raw_dir, run_id, environment, result).await {
            warn!("Run {}: failed to write raw results: {}", run_id, e);
            return None;
        }

        let rendered = if ctx.is_cancelled() {
            self.tool.generate(&raw_dir, &out_dir).await
        } else {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(OrchestratorError::Cancelled),
                rendered = self.tool.generate(&raw_dir, &out_dir) => rendered,
            }
        };

        match rendered {
            Ok(path) => {
                info!("Run {}: report written to {}", run_id, path.display());
                Some(path.to_string_lossy().into_owned())
            }
            Err(e) => {
                warn!("Run {}: report generation failed: {}", run_id, e);
                None
            }
        }
    }
}

/// Write one Allure result file per case plus `environment.properties`
async fn write_raw_results(
    raw_dir: &Path,
    run_id: i64,
    environment: &Environment,
    result: &RunResult,
) -> OrchestratorResult<()> {
    // Stale files from an earlier attempt would leak into this report
    if tokio::fs::try_exists(raw_dir).await? {
        tokio::fs::remove_dir_all(raw_dir).await?;
    }
    tokio::fs::create_dir_all(raw_dir).await?;

    let groups = [
        ("api", &result.api_results),
        ("ui", &result.ui_results),
        ("invalid", &result.invalid_results),
    ];
    for (suite, cases) in groups {
        for case in cases.iter() {
            let allure = allure_result(raw_dir, run_id, suite, case).await;
            let path = raw_dir.join(format!("{}-result.json", allure.uuid));
            tokio::fs::write(&path, serde_json::to_vec_pretty(&allure)?).await?;
        }
    }

    tokio::fs::write(
        raw_dir.join("environment.properties"),
        environment_properties(environment),
    )
    .await?;

    Ok(())
}

async fn allure_result(raw_dir: &Path, run_id: i64, suite: &str, case: &CaseResult) -> AllureResult {
    let stop = Utc::now().timestamp_millis();
    let start = stop - case.duration_ms as i64;

    let mut steps = Vec::new();
    let mut attachments = Vec::new();
    if let CaseDetails::Ui {
        steps: records,
        failed_step,
        screenshot,
    } = &case.details
    {
        let mut cursor = start;
        for record in records {
            let mut step_attachments = Vec::new();
            if let Some(shot) = &record.screenshot {
                step_attachments.extend(attach(raw_dir, shot, &record.name).await);
            }
            steps.push(AllureStep {
                name: record.name.clone(),
                status: "passed",
                stage: "finished",
                start: cursor,
                stop: cursor + record.duration_ms as i64,
                attachments: step_attachments,
            });
            cursor += record.duration_ms as i64;
        }
        if let Some(index) = failed_step {
            steps.push(AllureStep {
                name: format!("step {}", index),
                status: allure_status(case.status),
                stage: "finished",
                start: cursor,
                stop,
                attachments: Vec::new(),
            });
        }
        if let Some(shot) = screenshot {
            attachments.extend(attach(raw_dir, shot, "failure screenshot").await);
        }
    }

    AllureResult {
        uuid: Uuid::new_v4().to_string(),
        history_id: format!("{}:{}", suite, case.test_case_id),
        name: case.test_case_name.clone(),
        full_name: format!("run-{}.{}.{}", run_id, suite, case.test_case_name),
        status: allure_status(case.status),
        status_details: AllureStatusDetails {
            message: case.error.clone(),
            trace: response_trace(&case.details),
        },
        stage: "finished",
        start,
        stop,
        labels: vec![
            AllureLabel {
                name: "parentSuite",
                value: format!("run-{}", run_id),
            },
            AllureLabel {
                name: "suite",
                value: suite.to_string(),
            },
            AllureLabel {
                name: "testCaseId",
                value: case.test_case_id.to_string(),
            },
        ],
        steps,
        attachments,
    }
}

/// Copy a screenshot next to the result files
async fn attach(raw_dir: &Path, source: &str, name: &str) -> Option<AllureAttachment> {
    let file_name = format!("{}-attachment.png", Uuid::new_v4());
    match tokio::fs::copy(source, raw_dir.join(&file_name)).await {
        Ok(_) => Some(AllureAttachment {
            name: name.to_string(),
            source: file_name,
            mime: "image/png",
        }),
        Err(e) => {
            warn!("Cannot attach screenshot {}: {}", source, e);
            None
        }
    }
}

fn response_trace(details: &CaseDetails) -> Option<String> {
    match details {
        CaseDetails::Api {
            method: Some(method),
            url: Some(url),
            response_status,
            response_body,
            ..
        } => Some(format!(
            "{} {} -> {}\n{}",
            method,
            url,
            response_status.map_or_else(|| "no response".to_string(), |s| s.to_string()),
            response_body.as_deref().unwrap_or_default()
        )),
        _ => None,
    }
}

fn environment_properties(environment: &Environment) -> String {
    let mut lines = vec![
        format!("environment={}", environment.name),
        format!("base_url={}", environment.base_url),
    ];
    let mut keys: Vec<&String> = environment.config.keys().collect();
    keys.sort();
    for key in keys {
        lines.push(format!("{}={}", key, environment.config[key]));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactConfig;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use testrun_common::{StepRecord, Summary, TestCase};

    struct FakeTool {
        fail: bool,
        calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl ReportTool for FakeTool {
        async fn generate(&self, raw_dir: &Path, out_dir: &Path) -> OrchestratorResult<PathBuf> {
            self.calls.lock().push((raw_dir.to_path_buf(), out_dir.to_path_buf()));
            if self.fail {
                return Err(OrchestratorError::Report("boom".into()));
            }
            Ok(out_dir.to_path_buf())
        }
    }

    fn config(root: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            artifacts: ArtifactConfig {
                screenshots_dir: root.join("shots"),
                results_dir: root.join("results"),
                reports_dir: root.join("reports"),
            },
            ..Default::default()
        }
    }

    fn environment() -> Environment {
        Environment {
            id: 1,
            project_id: 1,
            name: "qa".into(),
            base_url: "http://qa.local".into(),
            config: HashMap::from([("region".to_string(), "eu".to_string())]),
        }
    }

    fn sample_result(screenshot: &Path) -> RunResult {
        let case = |id: i64, kind: &str| TestCase {
            id,
            project_id: 1,
            name: format!("case {}", id),
            kind: kind.into(),
            test_data: serde_json::Value::Null,
            created_by: 1,
        };
        let api = CaseResult::new(
            &case(1, "api"),
            CaseStatus::Passed,
            CaseDetails::Api {
                method: Some("GET".into()),
                url: Some("http://qa.local/health".into()),
                expected_status: Some(200),
                response_status: Some(200),
                response_body: Some("{}".into()),
            },
        );
        let ui = CaseResult::new(
            &case(2, "ui"),
            CaseStatus::Failed,
            CaseDetails::Ui {
                steps: vec![StepRecord {
                    index: 0,
                    name: "navigate:/".into(),
                    duration_ms: 12,
                    screenshot: None,
                }],
                failed_step: Some(1),
                screenshot: Some(screenshot.to_string_lossy().into_owned()),
            },
        )
        .with_error("step 1 failed");
        RunResult {
            api_results: vec![api],
            ui_results: vec![ui],
            summary: Summary::default(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_writes_raw_results_and_renders() {
        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("error.png");
        tokio::fs::write(&shot, b"png").await.unwrap();

        let tool = Arc::new(FakeTool {
            fail: false,
            calls: Mutex::new(vec![]),
        });
        let generator = ReportGenerator::new(tool.clone(), &config(dir.path()));
        let report = generator
            .generate(&RunContext::detached(9), 9, &environment(), &sample_result(&shot))
            .await;

        assert_eq!(report, Some(dir.path().join("reports/run-9").to_string_lossy().into_owned()));
        assert_eq!(tool.calls.lock()[0].0, dir.path().join("results/run-9"));

        let raw = dir.path().join("results/run-9");
        let mut results = 0;
        let mut attachments = 0;
        let mut entries = std::fs::read_dir(&raw).unwrap();
        while let Some(Ok(entry)) = entries.next() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with("-result.json") {
                results += 1;
                let value: serde_json::Value =
                    serde_json::from_slice(&std::fs::read(entry.path()).unwrap()).unwrap();
                if value["name"] == "case 2" {
                    assert_eq!(value["status"], "failed");
                    assert_eq!(value["attachments"][0]["type"], "image/png");
                }
            } else if name.ends_with("-attachment.png") {
                attachments += 1;
            }
        }
        assert_eq!(results, 2);
        assert_eq!(attachments, 1);

        let props = std::fs::read_to_string(raw.join("environment.properties")).unwrap();
        assert!(props.contains("base_url=http://qa.local"));
        assert!(props.contains("region=eu"));
    }

    #[tokio::test]
    async fn test_tool_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeTool {
            fail: true,
            calls: Mutex::new(vec![]),
        });
        let generator = ReportGenerator::new(tool, &config(dir.path()));
        let report = generator
            .generate(&RunContext::detached(1), 1, &environment(), &RunResult::default())
            .await;
        assert_eq!(report, None);
    }

    #[tokio::test]
    async fn test_missing_allure_binary() {
        let dir = tempfile::tempdir().unwrap();
        let cli = AllureCli::new(
            &ReportConfig {
                allure_binary: "/nonexistent/allure".into(),
            },
            Duration::from_secs(5),
        );
        let err = cli
            .generate(&dir.path().join("raw"), &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Report(_)));
    }
}
