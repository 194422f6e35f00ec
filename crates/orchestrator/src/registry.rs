//! Registry of in-flight runs
//!
//! An entry exists from the moment the coordinator starts a run until the run
//! reaches a terminal state. Stop requests flip the entry to
//! `CancelRequested` and fire its cancellation token; executors observe the
//! token at their suspension points.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use testrun_common::Error;

/// State of a registered run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Active,
    CancelRequested,
}

/// One in-flight run
#[derive(Debug)]
pub struct RegistryEntry {
    run_id: i64,
    token: CancellationToken,
    state: Mutex<EntryState>,
}

impl RegistryEntry {
    pub fn state(&self) -> EntryState {
        *self.state.lock()
    }

    /// Returns true only for the call that moved the entry out of `Active`
    fn request_cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state == EntryState::CancelRequested {
            return false;
        }
        *state = EntryState::CancelRequested;
        self.token.cancel();
        true
    }
}

/// What a case executor needs to know about the run it works for
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: i64,
    token: CancellationToken,
}

impl RunContext {
    pub fn new(run_id: i64, token: CancellationToken) -> Self {
        Self { run_id, token }
    }

    /// Context that is never cancelled
    pub fn detached(run_id: i64) -> Self {
        Self::new(run_id, CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Concurrency-safe map of in-flight runs
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    entries: DashMap<i64, Arc<RegistryEntry>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry for `run_id`. The returned guard removes it on drop.
    pub fn register(self: &Arc<Self>, run_id: i64) -> Result<Registration, Error> {
        let entry = match self.entries.entry(run_id) {
            Entry::Occupied(_) => {
                return Err(Error::AlreadyExists {
                    kind: "registered run".to_string(),
                    id: run_id.to_string(),
                })
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(RegistryEntry {
                    run_id,
                    token: CancellationToken::new(),
                    state: Mutex::new(EntryState::Active),
                });
                vacant.insert(entry.clone());
                entry
            }
        };

        debug!("Registered run {}", run_id);
        Ok(Registration {
            registry: Arc::clone(self),
            entry,
        })
    }

    /// Signal cancellation. Returns false when the run is not registered.
    pub fn cancel(&self, run_id: i64) -> bool {
        // Clone out of the map so no shard lock is held while cancelling
        let entry = self.entries.get(&run_id).map(|e| Arc::clone(e.value()));
        match entry {
            Some(entry) => {
                if entry.request_cancel() {
                    info!("Cancellation requested for run {}", run_id);
                }
                true
            }
            None => false,
        }
    }

    pub fn state(&self, run_id: i64) -> Option<EntryState> {
        self.entries.get(&run_id).map(|e| e.state())
    }

    pub fn is_registered(&self, run_id: i64) -> bool {
        self.entries.contains_key(&run_id)
    }

    /// Ids of every registered run, ascending
    pub fn active_runs(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&self, entry: &Arc<RegistryEntry>) {
        // Only remove the entry this guard inserted
        let removed = self
            .entries
            .remove_if(&entry.run_id, |_, current| Arc::ptr_eq(current, entry));
        if removed.is_some() {
            debug!("Unregistered run {}", entry.run_id);
        }
    }
}

/// Registration guard; dropping it removes the run from the registry
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ExecutionRegistry>,
    entry: Arc<RegistryEntry>,
}

impl Registration {
    pub fn run_id(&self) -> i64 {
        self.entry.run_id
    }

    pub fn context(&self) -> RunContext {
        RunContext::new(self.entry.run_id, self.entry.token.clone())
    }

    pub fn state(&self) -> EntryState {
        self.entry.state()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.entry);
    }
}
