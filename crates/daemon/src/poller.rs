//! Poll loop
//!
//! Picks up pending runs created by the request layer and applies queued
//! stop requests.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use testrun_common::{Database, RunStatus};
use testrun_orchestrator::{Coordinator, RunDispatcher, StopOutcome};

pub struct Poller {
    db: Database,
    coordinator: Arc<Coordinator>,
    dispatcher: RunDispatcher,
    interval: Duration,
}

impl Poller {
    pub fn new(
        db: Database,
        coordinator: Arc<Coordinator>,
        max_concurrent_runs: usize,
        interval: Duration,
    ) -> Self {
        Self {
            dispatcher: RunDispatcher::new(coordinator.clone(), max_concurrent_runs),
            db,
            coordinator,
            interval,
        }
    }

    /// Run the poll loop until the dispatcher is closed or the task is dropped
    pub async fn run(&self) {
        info!("Poller started (every {:?})", self.interval);

        while !self.dispatcher.is_closed() {
            if let Err(e) = self.poll_once() {
                error!("Poll error: {}", e);
            }

            tokio::time::sleep(self.interval).await;
        }
        debug!("Poller stopped");
    }

    /// One pass: apply stop requests, then dispatch pending runs
    pub fn poll_once(&self) -> testrun_common::Result<()> {
        self.apply_stop_requests()?;
        self.dispatch_pending()?;
        Ok(())
    }

    fn apply_stop_requests(&self) -> testrun_common::Result<()> {
        for run_id in self.db.take_stop_requests()? {
            match self.coordinator.stop(run_id) {
                Ok(StopOutcome::Signalled) => info!("Stop signalled for run {}", run_id),
                Ok(outcome) => debug!("Stop request for run {} ignored: {:?}", run_id, outcome),
                Err(e) => warn!("Stop request for run {} failed: {}", run_id, e),
            }
        }
        Ok(())
    }

    fn dispatch_pending(&self) -> testrun_common::Result<()> {
        for run_id in self.db.list_runs_by_status(RunStatus::Pending)? {
            if self.dispatcher.dispatch(run_id, None).is_some() {
                debug!("Queued run {}", run_id);
            }
        }
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Stop dispatching, cancel executing runs and wait up to `grace` for
    /// them to reach a terminal state. Returns how many are still in flight.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.dispatcher.close();
        for run_id in self.coordinator.registry().active_runs() {
            self.coordinator.registry().cancel(run_id);
        }

        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.in_flight()
    }
}
