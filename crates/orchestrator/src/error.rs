//! Error types for the orchestrator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] testrun_common::Error),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Playwright not found. Install with: npm install playwright && npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright driver exited: {0}")]
    DriverExited(String),

    #[error("Report generation failed: {0}")]
    Report(String),

    #[error("Timeout after {0} ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
