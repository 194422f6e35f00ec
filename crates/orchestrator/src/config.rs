//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::artifacts::ArtifactConfig;
use crate::playwright::PlaywrightConfig;
use crate::report::ReportConfig;

/// Configuration shared by the coordinator and both case executors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Ceiling on runs executing at the same time
    pub max_concurrent_runs: usize,

    /// Per-case ceiling, in seconds
    pub case_timeout_secs: u64,

    /// Timeout handed to the HTTP client for a single request
    pub request_timeout_secs: u64,

    /// Ceiling on a single report tool invocation
    pub report_timeout_secs: u64,

    /// Response bodies longer than this are truncated in case diagnostics
    pub max_captured_body_bytes: usize,

    /// Fallback base URL for API cases when the environment has none
    pub default_api_base_url: String,

    /// Fallback base URL for UI cases when the environment has none
    pub default_ui_base_url: String,

    pub artifacts: ArtifactConfig,

    pub playwright: PlaywrightConfig,

    pub report: ReportConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 5,
            case_timeout_secs: 300,
            request_timeout_secs: 60,
            report_timeout_secs: 120,
            max_captured_body_bytes: 64 * 1024,
            default_api_base_url: "http://localhost:8000".to_string(),
            default_ui_base_url: "http://localhost:3000".to_string(),
            artifacts: ArtifactConfig::default(),
            playwright: PlaywrightConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn case_timeout(&self) -> Duration {
        Duration::from_secs(self.case_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }
}
