//! Concurrent run dispatch
//!
//! Each dispatched run becomes its own tokio task. A semaphore caps how many
//! of them execute at once; the rest wait for a permit.

use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::coordinator::Coordinator;

pub struct RunDispatcher {
    coordinator: Arc<Coordinator>,
    permits: Arc<Semaphore>,
    queued: Arc<DashSet<i64>>,
}

impl RunDispatcher {
    pub fn new(coordinator: Arc<Coordinator>, max_concurrent_runs: usize) -> Self {
        Self {
            coordinator,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            queued: Arc::new(DashSet::new()),
        }
    }

    /// Queue a run for execution.
    ///
    /// Returns `None` if the run is already queued or executing.
    pub fn dispatch(&self, run_id: i64, case_filter: Option<Vec<i64>>) -> Option<JoinHandle<()>> {
        if !self.queued.insert(run_id) {
            debug!("Run {} already dispatched", run_id);
            return None;
        }

        let coordinator = self.coordinator.clone();
        let permits = self.permits.clone();
        let queued = self.queued.clone();

        Some(tokio::spawn(async move {
            let _slot = QueueSlot { queued, run_id };
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            info!("Dispatching run {}", run_id);
            match coordinator.execute(run_id, case_filter.as_deref()).await {
                Ok(run) => debug!("Run {} finished as {}", run_id, run.status),
                Err(e) => error!("Run {} could not be executed: {}", run_id, e),
            }
        }))
    }

    /// Runs queued or executing
    pub fn in_flight(&self) -> usize {
        self.queued.len()
    }

    /// Stop handing out permits; queued runs are dropped, executing runs finish
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// Removes the run from the queued set when its task ends
struct QueueSlot {
    queued: Arc<DashSet<i64>>,
    run_id: i64,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.queued.remove(&self.run_id);
    }
}
