//! Quad store storage engine.
//!
//! A single page file holding the permutation B-trees.
//!
//! # File Format
//!
//! The page file is a sequence of 8KB pages:
//!
//! - Pages 0-1: Superblock slots (newest valid generation wins)
//! - Remaining pages: B-tree nodes and free-list pages
//!
//! # Layers
//!
//! - [`Storage`]: raw block device, a file ([`PageFile`]) or simulated
//! - [`PageStore`]: allocation, checksums and the shadow-paging commit
//! - [`NodeCache`]: decoded nodes, pins and write-back
//! - [`Reclaimer`]: returns retired pages once no reader can reach them
//! - [`btree`]: the copy-on-write B-tree and its range scan
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use quadstore::simulation::SimulatedStorage;
//! use quadstore::storage::btree::{make_key, FLAG_EXPLICIT};
//! use quadstore::storage::{IndexRoot, NodeCache, PageStore, PagerOptions, Reclaimer};
//!
//! let pager = PageStore::create(
//!     Box::new(SimulatedStorage::new(7)),
//!     vec![IndexRoot { name: *b"spoc", root: 0 }],
//!     PagerOptions::default(),
//! )?;
//! let cache = NodeCache::new(Arc::new(pager), 1024, 16);
//! let reclaimer = Reclaimer::new();
//!
//! let mut tree = quadstore::storage::btree::BTree::new(&cache, &reclaimer, 0);
//! tree.insert(make_key([1, 2, 3, 0]), FLAG_EXPLICIT)?;
//! assert!(tree.search(&make_key([1, 2, 3, 0]))?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod btree;
mod file;
mod io;
mod node_cache;
mod page;
mod pager;
mod reclaim;
mod superblock;

pub use file::{FileError, PageFile};
pub use io::{Storage, StorageError};
pub use node_cache::{
    CacheError, DEFAULT_NODE_CACHE_MIN_RELEASED, DEFAULT_NODE_CACHE_SIZE, NodeCache,
    NodeCacheStats, PinnedNode,
};
pub use page::{PAGE_SIZE, PAGE_SIZE_U64, Page, PageError, PageHeader, PageId, PageType};
pub use pager::{
    CommitOutcome, FREE_IDS_PER_PAGE, PageStore, PagerOptions, PagerStats, Retirement,
};
pub use reclaim::{ReaderGuard, Reclaimer};
pub use superblock::{
    FORMAT_VERSION, IndexRoot, MAGIC, MAX_INDEXES, SUPERBLOCK_SLOTS, Superblock, SuperblockError,
};
