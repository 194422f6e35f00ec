//! Test-run orchestrator common library
//!
//! Data model, error types, and persistence shared by the orchestrator and
//! the daemon that hosts it.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use db::Database;
pub use error::{Error, Result};
pub use store::RunStore;
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".testrun")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
