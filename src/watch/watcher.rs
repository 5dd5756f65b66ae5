// src/watch/watcher.rs

use std::time::Duration;

use tracing::{debug, info};

use crate::watch::program_id::ProgramId;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Poll-based wait for a [`ProgramId`] to change.
///
/// A detected change is only reported if it is still there after the
/// debounce delay. An editor's atomic save (delete, then recreate with the
/// same bytes) therefore does not wake the caller, while a real edit costs
/// at most `debounce` extra latency.
#[derive(Debug, Clone, Copy)]
pub struct ChangeWatcher {
    interval: Duration,
    debounce: Duration,
}

impl Default for ChangeWatcher {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

impl ChangeWatcher {
    pub fn new(interval: Duration, debounce: Duration) -> Self {
        Self { interval, debounce }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Block the calling thread until `program_id` changes.
    pub fn wait(&self, program_id: &ProgramId) {
        info!(files = program_id.len(), "waiting for changes");
        loop {
            if program_id.changed() {
                if self.debounce.is_zero() {
                    return;
                }
                std::thread::sleep(self.debounce);
                if program_id.changed() {
                    return;
                }
                debug!("change did not survive debounce; still waiting");
            }
            std::thread::sleep(self.interval);
        }
    }

    /// Async flavour of [`ChangeWatcher::wait`].
    ///
    /// There is no cancellation at this layer; race the returned future
    /// against a shutdown signal with `tokio::select!`.
    pub async fn wait_async(&self, program_id: &ProgramId) {
        info!(files = program_id.len(), "waiting for changes");
        loop {
            if program_id.changed() {
                if self.debounce.is_zero() {
                    return;
                }
                tokio::time::sleep(self.debounce).await;
                if program_id.changed() {
                    return;
                }
                debug!("change did not survive debounce; still waiting");
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
