//! Synchronization gate.
//!
//! The automatic background synchronization pass must never overlap itself
//! and must not interleave its writes with a live generation turn. The gate
//! grants at most one guard at a time and makes acquisition wait, with a
//! one-second poll, for the host's generation flag to clear. Contention or
//! a wait timeout yields `None`, a silent no-op; the periodic trigger is
//! expected to retry later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const GENERATION_WAIT_LIMIT: Duration = Duration::from_secs(30);

#[derive(Clone, Default)]
pub struct SyncGate {
    busy: Arc<AtomicBool>,
    generating: Arc<AtomicBool>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host hook: marks a user-visible generation as in flight.
    pub fn set_generating(&self, active: bool) {
        self.generating.store(active, Ordering::SeqCst);
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Tries to start a synchronization pass. Returns `None` if another
    /// pass is already running or a live generation does not finish within
    /// the wait limit.
    pub async fn acquire(&self) -> Option<SyncGuard> {
        if self.busy.swap(true, Ordering::SeqCst) {
            tracing::debug!("Synchronization pass already running, skipping");
            return None;
        }

        let mut waited = Duration::ZERO;
        while self.is_generating() {
            if waited >= GENERATION_WAIT_LIMIT {
                tracing::debug!("Generation still active after wait limit, skipping sync");
                self.busy.store(false, Ordering::SeqCst);
                return None;
            }
            sleep(POLL_INTERVAL).await;
            waited += POLL_INTERVAL;
        }

        Some(SyncGuard {
            busy: Arc::clone(&self.busy),
        })
    }
}

/// Releases the gate on drop.
pub struct SyncGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}
