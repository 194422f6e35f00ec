//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use testrun_orchestrator::OrchestratorConfig;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// SQLite database holding runs, cases and environments
    pub db_path: PathBuf,

    /// How often the poller looks for pending runs and stop requests
    pub poll_interval_ms: u64,

    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: testrun_common::default_db_path(),
            poll_interval_ms: 1000,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file, falling back to defaults if it is absent
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}
