//! # Disk Budget
//!
//! The one piece of mutable state shared by every concurrent download.
//! Admission checks and reservations happen under a single lock, so two
//! requests can never both succeed against the same remaining space.
//!
//! ```text
//! capacity = consumed + reserved + available
//! ```
//!
//! A [`Reservation`] holds admitted-but-unwritten bytes. Committing moves the
//! actual size into `consumed`; dropping returns whatever is left.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{OfflineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub capacity: u64,
    pub consumed: u64,
    pub reserved: u64,
}

impl BudgetSnapshot {
    pub fn available(&self) -> u64 {
        self.capacity
            .saturating_sub(self.consumed.saturating_add(self.reserved))
    }

    /// More is promised than the volume can hold.
    pub fn is_over_committed(&self) -> bool {
        self.consumed.saturating_add(self.reserved) > self.capacity
    }
}

#[derive(Debug)]
struct BudgetState {
    capacity: u64,
    consumed: u64,
    reserved: u64,
    /// Upper bound that filesystem rechecks never raise capacity above.
    quota: Option<u64>,
}

impl BudgetState {
    fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            capacity: self.capacity,
            consumed: self.consumed,
            reserved: self.reserved,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiskBudget {
    state: Arc<Mutex<BudgetState>>,
}

impl DiskBudget {
    /// Budget bounded only by `capacity`, rebased on every recheck.
    pub fn new(capacity: u64) -> Self {
        Self::build(capacity, None)
    }

    /// Budget that never grows beyond `quota`.
    pub fn with_quota(quota: u64) -> Self {
        Self::build(quota, Some(quota))
    }

    fn build(capacity: u64, quota: Option<u64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BudgetState {
                capacity,
                consumed: 0,
                reserved: 0,
                quota,
            })),
        }
    }

    /// Accounts for content already on disk, e.g. restored download trees.
    pub fn with_consumed(self, bytes: u64) -> Self {
        self.state.lock().consumed = bytes;
        self
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        self.state.lock().snapshot()
    }

    pub fn available(&self) -> u64 {
        self.snapshot().available()
    }

    pub fn is_over_committed(&self) -> bool {
        self.snapshot().is_over_committed()
    }

    /// Reserves `bytes` or rejects the whole request. Check and reserve are atomic.
    pub fn try_reserve(&self, bytes: u64) -> Result<Reservation> {
        let mut state = self.state.lock();
        let available = state.snapshot().available();
        if bytes > available {
            debug!(requested = bytes, available, "Disk budget rejected reservation");
            return Err(OfflineError::InsufficientSpace {
                requested: bytes,
                available,
            });
        }
        state.reserved += bytes;
        drop(state);

        Ok(Reservation {
            budget: self.clone(),
            remaining: bytes,
        })
    }

    /// Returns bytes of removed content to the budget.
    pub fn release(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.consumed = state.consumed.saturating_sub(bytes);
    }

    /// Re-bases capacity on the free space the filesystem reports. Content
    /// already counted as consumed is on disk and therefore not free.
    pub fn recheck(&self, free_bytes: u64) -> BudgetSnapshot {
        let mut state = self.state.lock();
        let mut capacity = state.consumed.saturating_add(free_bytes);
        if let Some(quota) = state.quota {
            capacity = capacity.min(quota);
        }
        state.capacity = capacity;

        let snapshot = state.snapshot();
        if snapshot.is_over_committed() {
            warn!(
                capacity = snapshot.capacity,
                consumed = snapshot.consumed,
                reserved = snapshot.reserved,
                "Disk budget over-committed after recheck"
            );
        }
        snapshot
    }

    fn settle(&self, reserved: u64, consumed: u64) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(reserved);
        state.consumed = state.consumed.saturating_add(consumed);
    }
}

/// Admitted bytes not yet written.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it"]
pub struct Reservation {
    budget: DiskBudget,
    remaining: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.remaining
    }

    /// Moves up to `bytes` into a new reservation.
    pub fn split(&mut self, bytes: u64) -> Reservation {
        let taken = bytes.min(self.remaining);
        self.remaining -= taken;
        Reservation {
            budget: self.budget.clone(),
            remaining: taken,
        }
    }

    /// The content landed on disk with size `actual`.
    pub fn commit(mut self, actual: u64) {
        let reserved = std::mem::take(&mut self.remaining);
        self.budget.settle(reserved, actual);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.budget.settle(self.remaining, 0);
        }
    }
}
