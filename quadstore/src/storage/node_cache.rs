//! Cache of decoded B-tree nodes.
//!
//! Sits between the B-tree and the page store. Readers pin the nodes on their
//! current root-to-leaf path; the writer reads and replaces nodes without
//! pinning.
//!
//! # Design
//!
//! - Entries hold an `Arc<Node>`; a replaced entry never changes a node a
//!   reader already holds.
//! - Entries with usage 0 sit in a released list ordered by release time.
//!   Eviction only takes from that list, oldest first, and writes dirty
//!   nodes back before dropping them.
//! - `node_cache_size` is a soft cap: pinned nodes are never evicted, so the
//!   cache can exceed it while many readers are open.
//!
//! # Invariants
//!
//! - An entry with usage > 0 is never evicted.
//! - A dirty entry is only ever a page allocated by the running
//!   transaction, so writing it back never touches durable state.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::storage::btree::{Node, NodeError};
use crate::storage::io::StorageError;
use crate::storage::page::PageId;
use crate::storage::pager::PageStore;

/// Default soft cap on cached nodes.
pub const DEFAULT_NODE_CACHE_SIZE: usize = 4096;

/// Default number of released nodes kept regardless of the cap.
pub const DEFAULT_NODE_CACHE_MIN_RELEASED: usize = 64;

struct CacheEntry {
    node: Arc<Node>,
    usage: u32,
    dirty: bool,
    /// Position in the released list while `usage == 0`.
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<PageId, CacheEntry>,
    /// Released entries by release tick, oldest first.
    released: BTreeMap<u64, PageId>,
    next_tick: u64,
}

impl CacheState {
    fn mark_released(&mut self, page_id: PageId) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(&page_id) {
            entry.tick = tick;
            self.released.insert(tick, page_id);
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub cached: usize,
    pub pinned: usize,
}

/// The node cache.
pub struct NodeCache {
    pager: Arc<PageStore>,
    state: Mutex<CacheState>,
    capacity: usize,
    min_released: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

impl NodeCache {
    /// Create a cache over a page store.
    #[must_use]
    pub fn new(pager: Arc<PageStore>, capacity: usize, min_released: usize) -> Arc<Self> {
        Arc::new(Self {
            pager,
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            min_released,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
        })
    }

    /// The page store behind this cache.
    #[must_use]
    pub fn pager(&self) -> &Arc<PageStore> {
        &self.pager
    }

    fn state(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state.lock().map_err(|_| CacheError::LockPoisoned)
    }

    fn load(&self, page_id: PageId) -> Result<Arc<Node>, CacheError> {
        let page = self.pager.read_page(page_id)?;
        Ok(Arc::new(Node::from_page(&page, page_id)?))
    }

    /// Fetch a node, loading it from the page store on a miss.
    ///
    /// With `pin`, the usage count is incremented and the node leaves the
    /// released list.
    fn fetch(&self, page_id: PageId, pin: bool) -> Result<Arc<Node>, CacheError> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        if let Some(entry) = state.entries.get_mut(&page_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let node = Arc::clone(&entry.node);
            if pin {
                entry.usage += 1;
                if entry.usage == 1 {
                    let tick = entry.tick;
                    state.released.remove(&tick);
                }
            } else if entry.usage == 0 {
                // Refresh its position in the released list.
                let tick = entry.tick;
                state.released.remove(&tick);
                state.mark_released(page_id);
            }
            return Ok(node);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let node = self.load(page_id)?;
        state.entries.insert(
            page_id,
            CacheEntry {
                node: Arc::clone(&node),
                usage: u32::from(pin),
                dirty: false,
                tick: 0,
            },
        );
        if !pin {
            state.mark_released(page_id);
        }
        self.evict(state)?;
        Ok(node)
    }

    /// Read a node without pinning it.
    pub fn read(&self, page_id: PageId) -> Result<Arc<Node>, CacheError> {
        self.fetch(page_id, false)
    }

    /// Read and pin a node. The pin is released when the guard drops.
    pub fn pin(self: &Arc<Self>, page_id: PageId) -> Result<PinnedNode, CacheError> {
        let node = self.fetch(page_id, true)?;
        Ok(PinnedNode {
            cache: Arc::clone(self),
            page_id,
            node,
        })
    }

    /// Register a new or replaced node. The entry becomes dirty.
    pub fn put(&self, page_id: PageId, node: Node) -> Result<(), CacheError> {
        let mut state = self.state()?;
        let node = Arc::new(node);
        if let Some(entry) = state.entries.get_mut(&page_id) {
            entry.node = node;
            entry.dirty = true;
        } else {
            state.entries.insert(
                page_id,
                CacheEntry {
                    node,
                    usage: 0,
                    dirty: true,
                    tick: 0,
                },
            );
            state.mark_released(page_id);
        }
        self.evict(&mut state)
    }

    /// Decrement the usage of a pinned node.
    pub fn release(&self, page_id: PageId) -> Result<(), CacheError> {
        let mut state = self.state()?;
        let Some(entry) = state.entries.get_mut(&page_id) else {
            return Ok(());
        };
        debug_assert!(entry.usage > 0, "release of unpinned node {page_id}");
        entry.usage = entry.usage.saturating_sub(1);
        if entry.usage == 0 {
            state.mark_released(page_id);
            self.evict(&mut state)?;
        }
        Ok(())
    }

    /// Drop a node whose page is being returned to the free list.
    ///
    /// A pinned entry is kept; callers only discard pages no reader reaches.
    pub fn discard(&self, page_id: PageId) -> Result<(), CacheError> {
        let mut state = self.state()?;
        let pinned = state
            .entries
            .get(&page_id)
            .is_some_and(|entry| entry.usage > 0);
        if pinned {
            tracing::warn!("not discarding pinned node {page_id}");
            return Ok(());
        }
        if let Some(entry) = state.entries.remove(&page_id) {
            state.released.remove(&entry.tick);
        }
        Ok(())
    }

    /// Current usage count of a node (0 when not cached).
    pub fn usage(&self, page_id: PageId) -> Result<u32, CacheError> {
        Ok(self
            .state()?
            .entries
            .get(&page_id)
            .map_or(0, |entry| entry.usage))
    }

    /// Write every dirty node to the page store.
    ///
    /// Returns the number of nodes written.
    pub fn flush(&self) -> Result<usize, CacheError> {
        let mut state = self.state()?;
        let mut written = 0;
        let mut dirty: Vec<PageId> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(&page_id, _)| page_id)
            .collect();
        dirty.sort_unstable();

        for page_id in dirty {
            if let Some(entry) = state.entries.get_mut(&page_id) {
                self.pager.write_page(page_id, entry.node.to_page(page_id))?;
                entry.dirty = false;
                written += 1;
            }
        }
        if written > 0 {
            tracing::debug!("flushed {written} dirty nodes");
        }
        Ok(written)
    }

    /// Evict released entries, oldest first, while over capacity.
    fn evict(&self, state: &mut CacheState) -> Result<(), CacheError> {
        while state.entries.len() > self.capacity && state.released.len() > self.min_released {
            let Some((tick, page_id)) = state.released.pop_first() else {
                break;
            };
            let Some(entry) = state.entries.get(&page_id) else {
                continue;
            };
            debug_assert_eq!(entry.usage, 0);
            if entry.dirty {
                if let Err(e) = self
                    .pager
                    .write_page(page_id, entry.node.to_page(page_id))
                {
                    state.released.insert(tick, page_id);
                    return Err(e.into());
                }
                self.write_backs.fetch_add(1, Ordering::Relaxed);
            }
            state.entries.remove(&page_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Counters and occupancy.
    pub fn stats(&self) -> Result<NodeCacheStats, CacheError> {
        let state = self.state()?;
        Ok(NodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            cached: state.entries.len(),
            pinned: state.entries.len() - state.released.len(),
        })
    }
}

/// A pinned node. Dropping the guard releases the pin.
pub struct PinnedNode {
    cache: Arc<NodeCache>,
    page_id: PageId,
    node: Arc<Node>,
}

impl PinnedNode {
    #[must_use]
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PinnedNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl Drop for PinnedNode {
    fn drop(&mut self) {
        if let Err(e) = self.cache.release(self.page_id) {
            tracing::warn!("failed to release node {}: {e}", self.page_id);
        }
    }
}

impl std::fmt::Debug for PinnedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedNode")
            .field("page_id", &self.page_id)
            .finish_non_exhaustive()
    }
}

/// Errors from the node cache.
#[derive(Debug)]
pub enum CacheError {
    Storage(StorageError),
    Node(NodeError),
    LockPoisoned,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::LockPoisoned => write!(f, "node cache lock poisoned"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::LockPoisoned => None,
        }
    }
}

impl From<StorageError> for CacheError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<NodeError> for CacheError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}
