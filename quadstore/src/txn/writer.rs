//! The single writer slot.
//!
//! At most one connection mutates the working trees at a time. Direct
//! levels claim the slot at their first write without waiting; overlay
//! levels wait for it at `commit`, up to the lock timeout.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Holder of the writer slot, released on drop.
pub struct WriterGuard {
    slot: Arc<WriterSlot>,
    owner: u64,
}

impl WriterGuard {
    #[must_use]
    pub const fn owner(&self) -> u64 {
        self.owner
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.slot.release(self.owner);
    }
}

impl std::fmt::Debug for WriterGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterGuard")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// The slot itself.
#[derive(Default)]
pub struct WriterSlot {
    holder: Mutex<Option<u64>>,
    freed: Condvar,
}

impl WriterSlot {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot for `owner` if nobody holds it.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>, owner: u64) -> Option<WriterGuard> {
        let mut holder = self.holder.lock().ok()?;
        if holder.is_some() {
            return None;
        }
        *holder = Some(owner);
        Some(WriterGuard {
            slot: Arc::clone(self),
            owner,
        })
    }

    /// Claim the slot, waiting up to `timeout` for the current holder.
    #[must_use]
    pub fn acquire(self: &Arc<Self>, owner: u64, timeout: Duration) -> Option<WriterGuard> {
        let deadline = Instant::now() + timeout;
        let mut holder = self.holder.lock().ok()?;
        while holder.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            holder = self.freed.wait_timeout(holder, remaining).ok()?.0;
        }
        *holder = Some(owner);
        Some(WriterGuard {
            slot: Arc::clone(self),
            owner,
        })
    }

    /// Current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<u64> {
        self.holder.lock().ok().and_then(|holder| *holder)
    }

    fn release(&self, owner: u64) {
        let mut holder = match self.holder.lock() {
            Ok(holder) => holder,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *holder == Some(owner) {
            *holder = None;
            self.freed.notify_one();
        }
    }
}
