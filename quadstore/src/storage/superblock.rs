//! The superblock: root of every durable generation.
//!
//! Two superblock slots occupy pages 0 and 1. A commit of generation `g`
//! writes slot `g % 2`, so the previous durable superblock is never
//! overwritten by the commit that replaces it. On open the valid slot with
//! the highest generation wins.
//!
//! # Invariants
//!
//! - Every index root named here, and every page reachable from it, is
//!   never overwritten while this superblock is the newest durable one.
//! - `free_list_head` chains pages that hold no live data in this generation.

// PAGE_SIZE and MAX_INDEXES are compile-time constants that fit in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{PAGE_SIZE, Page, PageError, PageHeader, PageId, PageType};

/// Magic number identifying a quad store page file: "QUADSTOR"
pub const MAGIC: [u8; 8] = *b"QUADSTOR";

/// Bumped on any incompatible layout change.
pub const FORMAT_VERSION: u32 = 1;

/// Number of superblock slots (pages 0 and 1).
pub const SUPERBLOCK_SLOTS: u64 = 2;

/// Maximum number of permutation indexes one store can carry.
pub const MAX_INDEXES: usize = 4;

const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

/// Superblock field offsets (after the common page header).
mod offsets {
    pub const MAGIC: usize = 8;
    pub const FORMAT_VERSION: usize = 16;
    pub const PAGE_SIZE: usize = 20;
    pub const GENERATION: usize = 24;
    pub const TOTAL_PAGE_COUNT: usize = 32;
    pub const FREE_LIST_HEAD: usize = 40;
    pub const FREE_PAGE_COUNT: usize = 48;
    pub const TERM_COUNT: usize = 56;
    pub const INDEX_COUNT: usize = 64;
    // 4 x (name: 4 bytes, reserved: 4 bytes, root: 8 bytes)
    pub const INDEXES: usize = 72;
    pub const INDEX_ENTRY_SIZE: usize = 16;
}

/// Root of one permutation index as recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRoot {
    /// Field order, e.g. `*b"spoc"`.
    pub name: [u8; 4],
    /// Root node id, 0 for an empty tree.
    pub root: PageId,
}

/// The superblock contains all metadata about one durable generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Commit generation, incremented by every successful commit.
    pub generation: u64,
    /// Total number of pages in the file for this generation.
    pub total_page_count: u64,
    /// First page of the free-page chain (0 if empty).
    pub free_list_head: PageId,
    /// Number of pages listed in the free-page chain.
    pub free_page_count: u64,
    /// Number of terms in the dictionary when this generation committed.
    pub term_count: u64,
    /// Index permutations and their roots, in registry order.
    pub indexes: Vec<IndexRoot>,
}

impl Superblock {
    /// Create the superblock of a freshly created store.
    #[must_use]
    pub const fn new(indexes: Vec<IndexRoot>) -> Self {
        Self {
            generation: 0,
            total_page_count: SUPERBLOCK_SLOTS,
            free_list_head: 0,
            free_page_count: 0,
            term_count: 0,
            indexes,
        }
    }

    /// Page slot this superblock is written to.
    #[must_use]
    pub const fn slot(&self) -> PageId {
        self.generation % SUPERBLOCK_SLOTS
    }

    /// Serialize the superblock to a sealed page.
    pub fn to_page(&self) -> Result<Page, SuperblockError> {
        if self.indexes.len() > MAX_INDEXES {
            return Err(SuperblockError::TooManyIndexes(self.indexes.len()));
        }

        let mut page = Page::with_type(PageType::Superblock);
        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, FORMAT_VERSION);
        page.write_u32(offsets::PAGE_SIZE, PAGE_SIZE_U32);
        page.write_u64(offsets::GENERATION, self.generation);
        page.write_u64(offsets::TOTAL_PAGE_COUNT, self.total_page_count);
        page.write_u64(offsets::FREE_LIST_HEAD, self.free_list_head);
        page.write_u64(offsets::FREE_PAGE_COUNT, self.free_page_count);
        page.write_u64(offsets::TERM_COUNT, self.term_count);
        page.write_u32(offsets::INDEX_COUNT, self.indexes.len() as u32);
        for (i, index) in self.indexes.iter().enumerate() {
            let base = offsets::INDEXES + i * offsets::INDEX_ENTRY_SIZE;
            page.write_bytes(base, &index.name);
            page.write_u64(base + 8, index.root);
        }
        page.seal();

        Ok(page)
    }

    /// Decode and validate a superblock page.
    pub fn from_page(page: &Page) -> Result<Self, SuperblockError> {
        let header = PageHeader::read(page).map_err(SuperblockError::Page)?;
        if header.page_type != PageType::Superblock {
            return Err(SuperblockError::Page(PageError::InvalidPageType(
                header.page_type as u8,
            )));
        }
        page.verify_checksum().map_err(SuperblockError::Page)?;

        let mut magic = [0u8; 8];
        magic.copy_from_slice(page.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size != PAGE_SIZE_U32 {
            return Err(SuperblockError::InvalidPageSize(page_size));
        }

        let index_count = page.read_u32(offsets::INDEX_COUNT) as usize;
        if index_count > MAX_INDEXES {
            return Err(SuperblockError::TooManyIndexes(index_count));
        }
        let indexes = (0..index_count)
            .map(|i| {
                let base = offsets::INDEXES + i * offsets::INDEX_ENTRY_SIZE;
                let mut name = [0u8; 4];
                name.copy_from_slice(page.read_bytes(base, 4));
                IndexRoot {
                    name,
                    root: page.read_u64(base + 8),
                }
            })
            .collect();

        Ok(Self {
            generation: page.read_u64(offsets::GENERATION),
            total_page_count: page.read_u64(offsets::TOTAL_PAGE_COUNT),
            free_list_head: page.read_u64(offsets::FREE_LIST_HEAD),
            free_page_count: page.read_u64(offsets::FREE_PAGE_COUNT),
            term_count: page.read_u64(offsets::TERM_COUNT),
            indexes,
        })
    }

    /// Pick the newest valid superblock of the two slots.
    ///
    /// Invalid slots (never written, torn, wrong magic) are skipped; an
    /// error is returned only if neither slot is usable.
    pub fn select(slot_a: &Page, slot_b: &Page) -> Result<Self, SuperblockError> {
        match (Self::from_page(slot_a), Self::from_page(slot_b)) {
            (Ok(a), Ok(b)) => Ok(if b.generation > a.generation { b } else { a }),
            (Ok(a), Err(e)) => {
                if !slot_b.is_zeroed() {
                    tracing::warn!("ignoring invalid superblock in slot 1: {e}");
                }
                Ok(a)
            }
            (Err(e), Ok(b)) => {
                if !slot_a.is_zeroed() {
                    tracing::warn!("ignoring invalid superblock in slot 0: {e}");
                }
                Ok(b)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }
}

/// Why a superblock slot was rejected.
#[derive(Debug)]
pub enum SuperblockError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    UnsupportedVersion(u32),
    /// Invalid page size.
    InvalidPageSize(u32),
    /// More indexes than a superblock can record.
    TooManyIndexes(usize),
    /// Page header or checksum problem.
    Page(PageError),
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
            Self::TooManyIndexes(n) => {
                write!(f, "{n} indexes exceed the maximum of {MAX_INDEXES}")
            }
            Self::Page(e) => write!(f, "superblock page: {e}"),
        }
    }
}

impl std::error::Error for SuperblockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}
