//! Deferred page reclamation.
//!
//! A page removed from a tree may still be reachable by readers that started
//! before the removal. Readers register here before they read a root; pages
//! are queued with a retirement sequence number and handed back to the page
//! store only when every registered reader started at or after it.
//!
//! # Invariants
//!
//! - The sequence number grows by one for every retirement batch.
//! - A reader registered at sequence `s` can only reach pages retired at a
//!   sequence greater than `s`, or pages still live.
//! - While a reader of the working trees is registered, no tree page is
//!   rewritten in place.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::storage::io::StorageError;
use crate::storage::node_cache::{CacheError, NodeCache};
use crate::storage::page::PageId;

#[derive(Default)]
struct ReclaimState {
    seq: u64,
    next_token: u64,
    /// Active readers: token -> sequence at registration.
    readers: BTreeMap<u64, u64>,
    /// Active readers of the uncommitted working trees.
    working_readers: usize,
    /// Retired pages in retirement order.
    pending: VecDeque<(u64, PageId)>,
}

impl ReclaimState {
    fn oldest_reader(&self) -> Option<u64> {
        self.readers.values().copied().min()
    }
}

/// Registry of readers and retired pages.
#[derive(Default)]
pub struct Reclaimer {
    state: Mutex<ReclaimState>,
}

impl Reclaimer {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> Result<MutexGuard<'_, ReclaimState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Register a reader. It stays registered until the guard drops.
    pub fn register(self: &Arc<Self>) -> Result<ReaderGuard, StorageError> {
        let start = self.state()?.seq;
        self.register_at(start, false)
    }

    /// Register a reader of the working trees. Until the guard drops, tree
    /// writers copy every node they change instead of rewriting its page.
    pub fn register_working(self: &Arc<Self>) -> Result<ReaderGuard, StorageError> {
        let start = self.state()?.seq;
        self.register_at(start, true)
    }

    fn register_at(
        self: &Arc<Self>,
        start: u64,
        working: bool,
    ) -> Result<ReaderGuard, StorageError> {
        let mut state = self.state()?;
        let token = state.next_token;
        state.next_token += 1;
        state.readers.insert(token, start);
        if working {
            state.working_readers += 1;
        }
        Ok(ReaderGuard {
            reclaimer: Arc::clone(self),
            token,
            start,
            working,
        })
    }

    fn unregister(&self, token: u64, working: bool) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.readers.remove(&token);
        if working {
            state.working_readers -= 1;
        }
    }

    /// Whether any reader of the working trees is registered.
    pub fn has_working_readers(&self) -> Result<bool, StorageError> {
        Ok(self.state()?.working_readers > 0)
    }

    /// Queue pages that no tree references any more.
    pub fn retire(&self, pages: impl IntoIterator<Item = PageId>) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.seq += 1;
        let seq = state.seq;
        state.pending.extend(pages.into_iter().map(|page_id| (seq, page_id)));
        Ok(())
    }

    /// Pages queued but not yet reusable.
    pub fn pending(&self) -> Result<Vec<PageId>, StorageError> {
        Ok(self.state()?.pending.iter().map(|&(_, page_id)| page_id).collect())
    }

    /// Number of registered readers.
    pub fn active_readers(&self) -> Result<usize, StorageError> {
        Ok(self.state()?.readers.len())
    }

    /// Hand every page no reader can reach back to the page store.
    ///
    /// Returns the number of pages released.
    pub fn reclaim(&self, cache: &NodeCache) -> Result<usize, CacheError> {
        let mut state = self.state()?;
        let horizon = state.oldest_reader().unwrap_or(u64::MAX);

        let mut released = Vec::new();
        while let Some(&(seq, page_id)) = state.pending.front() {
            if seq > horizon {
                break;
            }
            state.pending.pop_front();
            released.push(page_id);
        }
        drop(state);

        if released.is_empty() {
            return Ok(0);
        }
        for &page_id in &released {
            cache.discard(page_id)?;
        }
        let count = released.len();
        cache.pager().release(released)?;
        tracing::debug!("reclaimed {count} pages");
        Ok(count)
    }
}

/// Registration of one reader; unregisters on drop.
pub struct ReaderGuard {
    reclaimer: Arc<Reclaimer>,
    token: u64,
    start: u64,
    working: bool,
}

impl ReaderGuard {
    /// A second registration that protects exactly what this one does.
    ///
    /// Lets an iterator outlive the transaction whose snapshot it reads.
    pub fn fork(&self) -> Result<Self, StorageError> {
        self.reclaimer.register_at(self.start, self.working)
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.reclaimer.unregister(self.token, self.working);
    }
}

impl std::fmt::Debug for ReaderGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderGuard")
            .field("token", &self.token)
            .field("start", &self.start)
            .field("working", &self.working)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedStorage;
    use crate::storage::pager::{PageStore, PagerOptions};
    use crate::storage::superblock::IndexRoot;

    fn cache() -> Arc<NodeCache> {
        let pager = PageStore::create(
            Box::new(SimulatedStorage::new(1)),
            vec![IndexRoot {
                name: *b"spoc",
                root: 0,
            }],
            PagerOptions::default(),
        )
        .expect("create pager");
        NodeCache::new(Arc::new(pager), 64, 0)
    }

    #[test]
    fn test_pages_wait_for_older_readers() {
        let cache = cache();
        let reclaimer = Reclaimer::new();
        let page = cache.pager().allocate().expect("allocate");
        cache.pager().retire(page).expect("retire");

        let reader = reclaimer.register().expect("register");
        reclaimer.retire([page]).expect("retire");
        assert_eq!(reclaimer.reclaim(&cache).expect("reclaim"), 0);
        assert_eq!(reclaimer.pending().expect("pending"), vec![page]);

        // A reader that starts after the retirement does not hold it back.
        let late = reclaimer.register().expect("register");
        assert_eq!(reclaimer.reclaim(&cache).expect("reclaim"), 0);

        drop(reader);
        assert_eq!(reclaimer.reclaim(&cache).expect("reclaim"), 1);
        assert!(reclaimer.pending().expect("pending").is_empty());
        drop(late);
        assert_eq!(reclaimer.active_readers().expect("readers"), 0);
    }

    #[test]
    fn test_released_pages_are_allocated_again() {
        let cache = cache();
        let reclaimer = Reclaimer::new();
        let page = cache.pager().allocate().expect("allocate");
        cache.pager().retire(page).expect("retire");
        reclaimer.retire([page]).expect("retire");
        reclaimer.reclaim(&cache).expect("reclaim");

        // The lowest free page comes back first.
        assert_eq!(cache.pager().allocate().expect("allocate"), page);
    }

    #[test]
    fn test_forked_guard_keeps_original_horizon() {
        let cache = cache();
        let reclaimer = Reclaimer::new();
        let page = cache.pager().allocate().expect("allocate");
        cache.pager().retire(page).expect("retire");

        let reader = reclaimer.register().expect("register");
        reclaimer.retire([page]).expect("retire");
        let fork = reader.fork().expect("fork");
        drop(reader);

        // The fork started where the original did, before the retirement.
        assert_eq!(reclaimer.reclaim(&cache).expect("reclaim"), 0);
        drop(fork);
        assert_eq!(reclaimer.reclaim(&cache).expect("reclaim"), 1);
    }

    #[test]
    fn test_working_readers_are_counted() {
        let reclaimer = Reclaimer::new();
        let plain = reclaimer.register().expect("register");
        assert!(!reclaimer.has_working_readers().expect("state"));

        let working = reclaimer.register_working().expect("register");
        let fork = working.fork().expect("fork");
        drop(working);
        assert!(reclaimer.has_working_readers().expect("state"));
        drop(fork);
        assert!(!reclaimer.has_working_readers().expect("state"));
        drop(plain);
        assert_eq!(reclaimer.active_readers().expect("readers"), 0);
    }
}
