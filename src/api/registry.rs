//! Poll registry: at most one in-flight poll per job id.
//!
//! One registry is created per session and shared by every poller in it.
//!
//! # Usage
//!
//! ```ignore
//! let registry = PollRegistry::new();
//!
//! // Claim the job id (fails if someone else is polling it)
//! let guard = registry.try_acquire("result-42").ok_or(...)?;
//!
//! // Poll while holding the guard...
//!
//! // The id is released when the guard is dropped, on every exit path
//! drop(guard);
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

// ─────────────────────────────────────────────────────────────────────────────
// PollRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Set of job ids with an active poll.
///
/// Cloning shares the same underlying set.
#[derive(Clone, Default)]
pub struct PollRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `job_id` without waiting.
    ///
    /// Returns `Some(guard)` if no poll for this id is active, `None` otherwise.
    pub fn try_acquire(&self, job_id: &str) -> Option<PollGuard> {
        let inserted = self.lock().insert(job_id.to_string());
        inserted.then(|| PollGuard {
            job_id: job_id.to_string(),
            registry: self.clone(),
        })
    }

    /// Returns true if a poll for `job_id` is active.
    pub fn is_active(&self, job_id: &str) -> bool {
        self.lock().contains(job_id)
    }

    /// Returns the number of active polls.
    pub fn active_polls(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    // A panic while holding the lock cannot leave the set half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PollGuard
// ─────────────────────────────────────────────────────────────────────────────

/// Exclusive claim on a job id; released on drop.
pub struct PollGuard {
    job_id: String,
    registry: PollRegistry,
}

impl PollGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.registry.release(&self.job_id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
