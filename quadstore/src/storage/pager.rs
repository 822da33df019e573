//! Shadow-paged page store.
//!
//! The pager owns the block device and decides which pages may be written.
//!
//! # Design
//!
//! - Committed pages are never overwritten. Writers allocate fresh pages
//!   from the free set, which only holds pages that no durable generation
//!   references.
//! - A commit writes the free list onto pages free in both the old and the
//!   new generation, forces, writes the alternate superblock slot and forces
//!   again. Until that last force returns, the previous superblock describes
//!   a complete, untouched tree.
//! - Pages superseded during a transaction are handed back to the caller at
//!   commit so they can be reused once no reader can reach them.
//!
//! # Invariants
//!
//! - `free`, `fresh`, `retired`, `chain` and the pages reachable from the
//!   durable superblock are pairwise disjoint.
//! - `fresh` pages are unreachable from the durable superblock.

#![allow(clippy::cast_possible_truncation)]

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::storage::io::{Storage, StorageError};
use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageId, PageType};
use crate::storage::superblock::{IndexRoot, SUPERBLOCK_SLOTS, Superblock};

/// Minimum number of pages added when the file grows.
const GROW_CHUNK_MIN: u64 = 16;

/// Free-list page layout (after the page header).
const FREE_NEXT_OFFSET: usize = PageHeader::SIZE;
const FREE_COUNT_OFFSET: usize = FREE_NEXT_OFFSET + 8;
const FREE_IDS_OFFSET: usize = FREE_COUNT_OFFSET + 8;

/// Page ids one free-list page can hold.
pub const FREE_IDS_PER_PAGE: usize = (PAGE_SIZE - FREE_IDS_OFFSET) / 8;

/// Options the pager consumes from the store configuration.
#[derive(Debug, Clone, Copy)]
pub struct PagerOptions {
    /// Grow the file when the free set runs out.
    pub auto_grow: bool,
    /// Pages pre-allocated when a store is created.
    pub initial_pages: u64,
    /// Force writes to stable storage at commit.
    pub force_sync: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            auto_grow: true,
            initial_pages: 64,
            force_sync: true,
        }
    }
}

/// How a page left the tree it belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    /// Allocated in the running transaction; no durable state references it.
    Fresh,
    /// Part of the durable state; free once the running transaction commits.
    Committed,
}

/// Result of a successful commit.
#[derive(Debug)]
pub struct CommitOutcome {
    /// The new durable superblock.
    pub superblock: Superblock,
    /// Committed pages the transaction superseded.
    pub retired: Vec<PageId>,
}

/// Space accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerStats {
    pub generation: u64,
    pub total_pages: u64,
    pub free_pages: u64,
    pub fresh_pages: u64,
}

#[derive(Default)]
struct AllocState {
    /// Pages no durable generation references and no writer holds.
    free: BTreeSet<PageId>,
    /// Pages allocated since the last commit.
    fresh: HashSet<PageId>,
    /// Committed pages superseded since the last commit.
    retired: Vec<PageId>,
    /// Pages holding the durable free-list chain.
    chain: Vec<PageId>,
}

/// The page store: a `Storage` plus allocation and the commit protocol.
pub struct PageStore {
    storage: Mutex<Box<dyn Storage + Send>>,
    alloc: Mutex<AllocState>,
    durable: Mutex<Superblock>,
    poisoned: AtomicBool,
    options: PagerOptions,
}

impl PageStore {
    /// Initialise an empty device as a new store.
    pub fn create(
        mut storage: Box<dyn Storage + Send>,
        indexes: Vec<IndexRoot>,
        options: PagerOptions,
    ) -> Result<Self, StorageError> {
        if storage.total_pages() != 0 {
            return Err(StorageError::Corruption(
                "refusing to create a store on a non-empty device".to_string(),
            ));
        }

        let total = options.initial_pages.max(SUPERBLOCK_SLOTS);
        storage.allocate_pages(total)?;

        let superblock = Superblock::new(indexes);
        let page = superblock
            .to_page()
            .map_err(|e| StorageError::Corruption(e.to_string()))?;
        storage.write_page(superblock.slot(), &page)?;
        storage.write_page(1 - superblock.slot(), &Page::new())?;
        storage.sync()?;

        let alloc = AllocState {
            free: (SUPERBLOCK_SLOTS..total).collect(),
            ..AllocState::default()
        };

        tracing::info!("created page store with {total} pages");

        Ok(Self {
            storage: Mutex::new(storage),
            alloc: Mutex::new(alloc),
            durable: Mutex::new(superblock),
            poisoned: AtomicBool::new(false),
            options,
        })
    }

    /// Open a device holding an existing store.
    ///
    /// Picks the newest valid superblock and rebuilds the free set from its
    /// free-list chain. Pages beyond that superblock's page count were grown
    /// by a commit that never completed and are free.
    pub fn open(
        mut storage: Box<dyn Storage + Send>,
        options: PagerOptions,
    ) -> Result<Self, StorageError> {
        let device_pages = storage.total_pages();
        if device_pages < SUPERBLOCK_SLOTS {
            return Err(StorageError::Corruption(format!(
                "page file has {device_pages} pages, expected at least {SUPERBLOCK_SLOTS}"
            )));
        }

        let slot_a = storage.read_page(0)?;
        let slot_b = storage.read_page(1)?;
        let superblock = Superblock::select(&slot_a, &slot_b)
            .map_err(|e| StorageError::Corruption(format!("no valid superblock: {e}")))?;

        if superblock.total_page_count > device_pages {
            return Err(StorageError::Corruption(format!(
                "superblock expects {} pages, file has {device_pages}",
                superblock.total_page_count
            )));
        }

        let (chain, mut free) = read_free_chain(storage.as_mut(), &superblock)?;
        free.extend(superblock.total_page_count..device_pages);

        tracing::info!(
            "opened page store at generation {} ({} pages, {} free)",
            superblock.generation,
            device_pages,
            free.len()
        );

        Ok(Self {
            storage: Mutex::new(storage),
            alloc: Mutex::new(AllocState {
                free,
                chain,
                ..AllocState::default()
            }),
            durable: Mutex::new(superblock),
            poisoned: AtomicBool::new(false),
            options,
        })
    }

    fn storage(&self) -> Result<MutexGuard<'_, Box<dyn Storage + Send>>, StorageError> {
        self.storage.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn alloc(&self) -> Result<MutexGuard<'_, AllocState>, StorageError> {
        self.alloc.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(StorageError::Poisoned);
        }
        Ok(())
    }

    /// The newest durable superblock.
    pub fn superblock(&self) -> Result<Superblock, StorageError> {
        self.durable
            .lock()
            .map(|sb| sb.clone())
            .map_err(|_| StorageError::LockPoisoned)
    }

    /// True once a commit failed in a way that leaves the durable state unknown.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Read a page and verify its checksum.
    pub fn read_page(&self, page_id: PageId) -> Result<Page, StorageError> {
        let page = self.storage()?.read_page(page_id)?;
        page.verify_checksum()
            .map_err(|e| StorageError::Corruption(format!("page {page_id}: {e}")))?;
        Ok(page)
    }

    /// Seal and write a page. Only pages that are not durable may be written.
    pub fn write_page(&self, page_id: PageId, mut page: Page) -> Result<(), StorageError> {
        self.check_writable()?;
        page.seal();
        self.storage()?.write_page(page_id, &page)
    }

    /// Allocate a page for the running transaction.
    pub fn allocate(&self) -> Result<PageId, StorageError> {
        self.check_writable()?;
        let mut alloc = self.alloc()?;
        let page_id = match alloc.free.pop_first() {
            Some(page_id) => page_id,
            None => {
                self.grow(&mut alloc)?;
                alloc
                    .free
                    .pop_first()
                    .ok_or(StorageError::StoreFull { total_pages: 0 })?
            }
        };
        alloc.fresh.insert(page_id);
        Ok(page_id)
    }

    fn grow(&self, alloc: &mut AllocState) -> Result<(), StorageError> {
        let mut storage = self.storage()?;
        let total = storage.total_pages();
        if !self.options.auto_grow {
            return Err(StorageError::StoreFull { total_pages: total });
        }
        let chunk = (total / 4).max(GROW_CHUNK_MIN);
        let first = storage.allocate_pages(chunk)?;
        alloc.free.extend(first..first + chunk);
        tracing::debug!("grew page file by {chunk} pages to {}", total + chunk);
        Ok(())
    }

    /// True if the page was allocated in the running transaction.
    pub fn is_fresh(&self, page_id: PageId) -> Result<bool, StorageError> {
        Ok(self.alloc()?.fresh.contains(&page_id))
    }

    /// Record that a page is no longer part of the working tree.
    pub fn retire(&self, page_id: PageId) -> Result<Retirement, StorageError> {
        let mut alloc = self.alloc()?;
        if alloc.fresh.remove(&page_id) {
            Ok(Retirement::Fresh)
        } else {
            alloc.retired.push(page_id);
            Ok(Retirement::Committed)
        }
    }

    /// Return pages no reader can reach to the free set.
    pub fn release(&self, pages: impl IntoIterator<Item = PageId>) -> Result<(), StorageError> {
        let mut alloc = self.alloc()?;
        for page_id in pages {
            debug_assert!(!alloc.fresh.contains(&page_id), "released a live page");
            alloc.free.insert(page_id);
        }
        Ok(())
    }

    /// Abandon the running transaction.
    ///
    /// Returns the pages it allocated; they hold no durable data but readers
    /// of the working tree may still be positioned on them.
    pub fn rollback(&self) -> Result<Vec<PageId>, StorageError> {
        let mut alloc = self.alloc()?;
        alloc.retired.clear();
        Ok(alloc.fresh.drain().collect())
    }

    /// Make the working tree durable as the next generation.
    ///
    /// `deferred` lists pages that are free in the new generation but still
    /// readable by in-flight readers; they are recorded as free on disk
    /// without being overwritten now.
    pub fn commit(
        &self,
        indexes: Vec<IndexRoot>,
        term_count: u64,
        deferred: &[PageId],
    ) -> Result<CommitOutcome, StorageError> {
        self.check_writable()?;
        let mut alloc = self.alloc()?;
        let mut durable = self.durable.lock().map_err(|_| StorageError::LockPoisoned)?;

        let mut listed: BTreeSet<PageId> = alloc.free.clone();
        listed.extend(deferred.iter().copied());
        listed.extend(alloc.retired.iter().copied());
        listed.extend(alloc.chain.iter().copied());

        // Chain pages come from `free`: free in the durable generation and
        // in the new one.
        let mut chain = Vec::new();
        while chain.len() * FREE_IDS_PER_PAGE < listed.len() {
            if alloc.free.is_empty() {
                let before = alloc.free.len();
                if let Err(e) = self.grow(&mut alloc) {
                    alloc.free.extend(chain);
                    return Err(e);
                }
                debug_assert!(alloc.free.len() > before);
                listed.extend(alloc.free.iter().copied());
            }
            if let Some(page_id) = alloc.free.pop_first() {
                listed.remove(&page_id);
                chain.push(page_id);
            }
        }

        let result = self.write_generation(&chain, &listed, indexes, term_count, &durable);
        match result {
            Ok(superblock) => {
                let old_chain = std::mem::replace(&mut alloc.chain, chain);
                alloc.free.extend(old_chain);
                alloc.fresh.clear();
                let retired = std::mem::take(&mut alloc.retired);
                *durable = superblock.clone();
                tracing::debug!(
                    "committed generation {} ({} free pages, {} retired)",
                    superblock.generation,
                    superblock.free_page_count,
                    retired.len()
                );
                Ok(CommitOutcome {
                    superblock,
                    retired,
                })
            }
            Err(e) => {
                alloc.free.extend(chain);
                Err(e)
            }
        }
    }

    fn write_generation(
        &self,
        chain: &[PageId],
        listed: &BTreeSet<PageId>,
        indexes: Vec<IndexRoot>,
        term_count: u64,
        durable: &Superblock,
    ) -> Result<Superblock, StorageError> {
        let mut storage = self.storage()?;

        let ids: Vec<PageId> = listed.iter().copied().collect();
        for (i, &page_id) in chain.iter().enumerate() {
            let start = (i * FREE_IDS_PER_PAGE).min(ids.len());
            let end = ((i + 1) * FREE_IDS_PER_PAGE).min(ids.len());
            let next = chain.get(i + 1).copied().unwrap_or(0);
            let mut page = free_list_page(next, &ids[start..end]);
            page.seal();
            storage.write_page(page_id, &page)?;
        }
        if self.options.force_sync {
            storage.sync()?;
        }

        let superblock = Superblock {
            generation: durable.generation + 1,
            total_page_count: storage.total_pages(),
            free_list_head: chain.first().copied().unwrap_or(0),
            free_page_count: ids.len() as u64,
            term_count,
            indexes,
        };
        let page = superblock
            .to_page()
            .map_err(|e| StorageError::Corruption(e.to_string()))?;

        // From here on the durable state is ambiguous if anything fails.
        let written = storage
            .write_page(superblock.slot(), &page)
            .and_then(|()| {
                if self.options.force_sync {
                    storage.sync()
                } else {
                    Ok(())
                }
            });
        if let Err(e) = written {
            self.poisoned.store(true, Ordering::Release);
            tracing::warn!(
                "commit of generation {} failed after superblock write: {e}; store poisoned",
                superblock.generation
            );
            return Err(e);
        }

        Ok(superblock)
    }

    /// Space accounting.
    pub fn stats(&self) -> Result<PagerStats, StorageError> {
        let alloc = self.alloc()?;
        let total_pages = self.storage()?.total_pages();
        let generation = self.superblock()?.generation;
        Ok(PagerStats {
            generation,
            total_pages,
            free_pages: alloc.free.len() as u64,
            fresh_pages: alloc.fresh.len() as u64,
        })
    }
}

fn free_list_page(next: PageId, ids: &[PageId]) -> Page {
    let mut page = Page::with_type(PageType::FreeList);
    page.write_u64(FREE_NEXT_OFFSET, next);
    page.write_u64(FREE_COUNT_OFFSET, ids.len() as u64);
    for (i, &page_id) in ids.iter().enumerate() {
        page.write_u64(FREE_IDS_OFFSET + i * 8, page_id);
    }
    page
}

/// Read the free-list chain of a superblock.
///
/// Returns the chain pages and the free page ids they list.
fn read_free_chain(
    storage: &mut dyn Storage,
    superblock: &Superblock,
) -> Result<(Vec<PageId>, BTreeSet<PageId>), StorageError> {
    let mut chain = Vec::new();
    let mut free = BTreeSet::new();
    let mut next = superblock.free_list_head;

    while next != 0 {
        if next < SUPERBLOCK_SLOTS
            || next >= superblock.total_page_count
            || chain.contains(&next)
        {
            return Err(StorageError::Corruption(format!(
                "free-list chain points at invalid page {next}"
            )));
        }
        let page = storage.read_page(next)?;
        page.verify_checksum()
            .map_err(|e| StorageError::Corruption(format!("free-list page {next}: {e}")))?;
        let header = PageHeader::read(&page)
            .map_err(|e| StorageError::Corruption(format!("free-list page {next}: {e}")))?;
        if header.page_type != PageType::FreeList {
            return Err(StorageError::Corruption(format!(
                "page {next} is not a free-list page"
            )));
        }

        let count = page.read_u64(FREE_COUNT_OFFSET) as usize;
        if count > FREE_IDS_PER_PAGE {
            return Err(StorageError::Corruption(format!(
                "free-list page {next} claims {count} entries"
            )));
        }
        for i in 0..count {
            let page_id = page.read_u64(FREE_IDS_OFFSET + i * 8);
            if page_id < SUPERBLOCK_SLOTS || page_id >= superblock.total_page_count {
                return Err(StorageError::Corruption(format!(
                    "free-list page {next} lists invalid page {page_id}"
                )));
            }
            free.insert(page_id);
        }
        chain.push(next);
        next = page.read_u64(FREE_NEXT_OFFSET);
    }

    if free.len() as u64 != superblock.free_page_count {
        return Err(StorageError::Corruption(format!(
            "free list holds {} pages, superblock records {}",
            free.len(),
            superblock.free_page_count
        )));
    }

    Ok((chain, free))
}
