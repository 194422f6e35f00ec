//! Core types for the test-run orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, Result};

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }

    /// Whether moving to `next` respects pending -> running -> {passed, failed}
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Passed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::Internal(format!("unknown run status: {}", other))),
        }
    }
}

/// One execution attempt of a project's test cases against one environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub project_id: i64,
    pub environment_id: i64,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<RunResult>,
    pub report_path: Option<String>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Move a pending run to running and stamp the start time
    pub fn start(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)?;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    /// Record the terminal state of a running run
    pub fn finish(
        &mut self,
        status: RunStatus,
        result: RunResult,
        report_path: Option<String>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.transition(status)?;
        self.end_time = Some(Utc::now());
        self.result = Some(result);
        self.report_path = report_path;
        Ok(())
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Test case kind after classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseKind {
    Api,
    Ui,
}

impl std::fmt::Display for CaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseKind::Api => write!(f, "api"),
            CaseKind::Ui => write!(f, "ui"),
        }
    }
}

/// A single test definition owned by a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    /// Raw kind as stored; see [`TestCase::classify`]
    pub kind: String,
    /// Kind-specific parameters
    #[serde(default)]
    pub test_data: serde_json::Value,
    pub created_by: i64,
}

impl TestCase {
    /// Classify the stored kind. Anything other than `api` or `ui` is `None`.
    pub fn classify(&self) -> Option<CaseKind> {
        match self.kind.trim().to_ascii_lowercase().as_str() {
            "api" => Some(CaseKind::Api),
            "ui" => Some(CaseKind::Ui),
            _ => None,
        }
    }
}

/// Target environment, read-only to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Environment {
    /// Base URL with a fallback for environments that leave it empty
    pub fn base_url_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        let trimmed = self.base_url.trim();
        if trimmed.is_empty() {
            fallback
        } else {
            trimmed.trim_end_matches('/')
        }
    }
}

/// Per-case outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    Error,
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseStatus::Passed => write!(f, "passed"),
            CaseStatus::Failed => write!(f, "failed"),
            CaseStatus::Error => write!(f, "error"),
        }
    }
}

/// Record of one executed UI step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// Kind-specific diagnostics attached to a case result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaseDetails {
    Api {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_body: Option<String>,
    },
    Ui {
        #[serde(default)]
        steps: Vec<StepRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_step: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
    },
    /// Case rejected before reaching an executor
    Invalid { kind: String },
}

/// Ephemeral outcome of a single case, folded into [`RunResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub test_case_id: i64,
    pub test_case_name: String,
    pub status: CaseStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    pub details: CaseDetails,
}

impl CaseResult {
    pub fn new(case: &TestCase, status: CaseStatus, details: CaseDetails) -> Self {
        Self {
            test_case_id: case.id,
            test_case_name: case.name.clone(),
            status,
            duration_ms: 0,
            error: None,
            cancelled: false,
            details,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Mark as an `error` result interrupted by a stop request
    pub fn cancelled(mut self) -> Self {
        self.status = CaseStatus::Error;
        self.cancelled = true;
        self.error = Some("cancelled".to_string());
        self
    }

    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }

    /// Screenshot recorded for a failing UI case, if any
    pub fn screenshot(&self) -> Option<&str> {
        match &self.details {
            CaseDetails::Ui { screenshot, .. } => screenshot.as_deref(),
            _ => None,
        }
    }
}

/// Scalar counts over every case result of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub error: usize,
}

impl Summary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a CaseResult>) -> Self {
        let mut summary = Summary::default();
        for result in results {
            summary.total += 1;
            match result.status {
                CaseStatus::Passed => summary.passed += 1,
                CaseStatus::Failed => summary.failed += 1,
                CaseStatus::Error => summary.error += 1,
            }
        }
        summary
    }
}

/// Persisted result payload of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub api_results: Vec<CaseResult>,
    #[serde(default)]
    pub ui_results: Vec<CaseResult>,
    /// Cases whose kind is neither `api` nor `ui`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_results: Vec<CaseResult>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    /// Payload for a run that failed outside of case-level handling
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
