//! Persistence contract consumed by the orchestrator

use crate::types::{Environment, Run, TestCase};
use crate::Result;

/// Storage for runs and the records they reference.
///
/// The coordinator is the only writer. `save_run` must persist all of a run's
/// fields atomically.
pub trait RunStore: Send + Sync {
    /// Load a run by id
    fn load_run(&self, id: i64) -> Result<Option<Run>>;

    /// Load the cases of a project, optionally restricted to `ids`, ordered by id
    fn load_cases(&self, project_id: i64, ids: Option<&[i64]>) -> Result<Vec<TestCase>>;

    /// Load an environment by id
    fn load_environment(&self, id: i64) -> Result<Option<Environment>>;

    /// Persist every mutable field of a run
    fn save_run(&self, run: &Run) -> Result<()>;
}
