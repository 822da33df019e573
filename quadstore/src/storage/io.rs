//! The block device under the page store.
//!
//! A [`Storage`] only models bytes and durability: pages in, pages out,
//! `sync`, and growth. Superblock selection, checksums and the free list
//! live one layer up in the pager, so [`PageFile`](super::PageFile) and the
//! simulated device stay small.

use crate::storage::page::{Page, PageId};

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
    /// A fault injected by the simulated device.
    InjectedFault(String),
    Corruption(String),
    /// No free page is available and the file may not grow.
    StoreFull { total_pages: u64 },
    /// A previous commit failed after its superblock was issued; the
    /// durable state is unknown until the store is reopened.
    Poisoned,
    /// Internal lock poisoned.
    LockPoisoned,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "storage I/O failed: {e}"),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => write!(f, "page {page_id} is past the end ({total_pages} pages)"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::StoreFull { total_pages } => {
                write!(f, "store is full ({total_pages} pages, auto-grow disabled)")
            }
            Self::Poisoned => write!(
                f,
                "page store refused write after a failed commit; reopen the store"
            ),
            Self::LockPoisoned => write!(f, "page store lock poisoned"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A device of fixed-size pages.
///
/// Contract:
/// - a read returns the last write to that page, or zeroes if the page was
///   allocated and never written
/// - writes may stay volatile until `sync`; `sync` makes every earlier write
///   and every earlier growth durable
pub trait Storage {
    fn read_page(&mut self, page_id: PageId) -> Result<Page, StorageError>;

    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError>;

    fn sync(&mut self) -> Result<(), StorageError>;

    /// Grow by `count` zeroed pages. Returns the first new page id.
    fn allocate_pages(&mut self, count: u64) -> Result<PageId, StorageError>;

    fn total_pages(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let e = StorageError::PageOutOfBounds {
            page_id: 10,
            total_pages: 5,
        };
        assert!(e.to_string().contains("page 10"));
        assert!(e.to_string().contains("(5 pages)"));

        let e = StorageError::InjectedFault("test fault".to_string());
        assert!(e.to_string().contains("test fault"));

        let e = StorageError::StoreFull { total_pages: 64 };
        assert!(e.to_string().contains("64 pages"));
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error as _;
        let e = StorageError::from(std::io::Error::other("disk on fire"));
        assert!(e.source().is_some());
        assert!(StorageError::Poisoned.source().is_none());
    }
}
