//! Execution state of the sync executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How a drain ended, as seen by waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failed(String),
}

/// Receives the outcome of the in-flight drain. `None` while it runs.
pub type ExecutionWatch = watch::Receiver<Option<ExecutionOutcome>>;

/// What the executor is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SharingPhase {
    Idle,
    Draining,
    RetryScheduled,
}

/// Read-only snapshot of the sharing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingStatus {
    pub phase: SharingPhase,
    pub has_pending_actions: bool,
    pub queued_actions: u64,
    pub shared_lists: u64,
    pub shared_annotations: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
}

/// The pending retry timer.
pub(crate) struct RetryTimer {
    pub generation: u64,
    pub handle: JoinHandle<()>,
}

/// Mutable executor state. Only the executor touches it, always under its lock.
#[derive(Default)]
pub(crate) struct SharingState {
    pub has_pending_actions: bool,
    pub executing: Option<ExecutionWatch>,
    pub retry: Option<RetryTimer>,
    pub retry_generation: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
}

impl SharingState {
    pub fn is_executing(&self) -> bool {
        self.executing.is_some()
    }

    pub fn is_retry_scheduled(&self) -> bool {
        self.retry
            .as_ref()
            .map(|timer| !timer.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn phase(&self) -> SharingPhase {
        if self.is_executing() {
            SharingPhase::Draining
        } else if self.is_retry_scheduled() {
            SharingPhase::RetryScheduled
        } else {
            SharingPhase::Idle
        }
    }

    /// Stop a pending retry timer.
    pub fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry.take() {
            timer.handle.abort();
        }
    }

    /// Called by a firing timer. Returns false if a newer timer replaced it.
    pub fn claim_retry(&mut self, generation: u64) -> bool {
        match &self.retry {
            Some(timer) if timer.generation == generation => {
                self.retry = None;
                true
            }
            _ => false,
        }
    }

    /// The queue was found empty at the end of a drain.
    pub fn finish_drain(&mut self) {
        self.has_pending_actions = false;
        self.executing = None;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_synced = Some(Utc::now());
    }

    /// A drain stopped on an error.
    pub fn fail_drain(&mut self, error: &str) {
        self.executing = None;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
    }
}
