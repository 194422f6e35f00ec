//! Filesystem layout for run artifacts
//!
//! Everything a run writes is namespaced by run id, and screenshots also by
//! case id plus a random token, so concurrent runs never collide.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Artifact roots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Screenshots taken by UI cases
    pub screenshots_dir: PathBuf,

    /// Raw per-case result files consumed by the report tool
    pub results_dir: PathBuf,

    /// Rendered reports
    pub reports_dir: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            screenshots_dir: PathBuf::from("screenshots"),
            results_dir: PathBuf::from("allure-results"),
            reports_dir: PathBuf::from("allure-reports"),
        }
    }
}

/// Resolves artifact paths for a run
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    config: ArtifactConfig,
}

impl ArtifactLayout {
    pub fn new(config: ArtifactConfig) -> Self {
        Self { config }
    }

    /// Directory holding one case's screenshots
    pub fn case_dir(&self, run_id: i64, case_id: i64) -> PathBuf {
        self.config
            .screenshots_dir
            .join(run_dir_name(run_id))
            .join(format!("case-{}", case_id))
    }

    /// Fresh, unique screenshot path for a case. `label` is sanitized.
    pub fn screenshot_path(&self, run_id: i64, case_id: i64, label: &str) -> PathBuf {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.case_dir(run_id, case_id)
            .join(format!("{}-{}.png", sanitize(label), &token[..8]))
    }

    /// Raw results directory for a run
    pub fn results_dir(&self, run_id: i64) -> PathBuf {
        self.config.results_dir.join(run_dir_name(run_id))
    }

    /// Report output directory for a run
    pub fn report_dir(&self, run_id: i64) -> PathBuf {
        self.config.reports_dir.join(run_dir_name(run_id))
    }
}

fn run_dir_name(run_id: i64) -> String {
    format!("run-{}", run_id)
}

fn sanitize(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "shot".to_string()
    } else {
        cleaned
    }
}

/// Create the parent directory of `path`
pub(crate) async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}
