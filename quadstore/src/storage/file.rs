//! The page file.
//!
//! [`PageFile`] is the on-disk [`Storage`]: a flat file whose length is
//! always a whole number of pages. Page `n` lives at byte `n * PAGE_SIZE`.
//!
//! # Invariants
//!
//! - `total_pages * PAGE_SIZE` equals the file length after every call.
//! - A sync after the file grew also flushes the new length; otherwise only
//!   data is flushed.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::storage::io::{Storage, StorageError};
use crate::storage::page::{PAGE_SIZE_U64, Page, PageId};

/// A page file on disk.
pub struct PageFile {
    file: File,
    path: PathBuf,
    total_pages: u64,
    /// The length changed since the last sync.
    grown: bool,
}

impl PageFile {
    /// Create an empty page file. Fails if `path` exists.
    pub fn create(path: &Path) -> Result<Self, FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => FileError::AlreadyExists(path.to_path_buf()),
                _ => FileError::Io(e),
            })?;
        file.sync_all().map_err(FileError::Io)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            total_pages: 0,
            grown: false,
        })
    }

    /// Open an existing page file.
    ///
    /// Bytes past the last whole page, left by a grow the process never
    /// finished, are cut off.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        let len = file.metadata().map_err(FileError::Io)?.len();
        let total_pages = len / PAGE_SIZE_U64;
        let torn = len % PAGE_SIZE_U64;
        if torn != 0 {
            tracing::warn!(
                "{}: cutting {torn} bytes of a partial page",
                path.display()
            );
            file.set_len(total_pages * PAGE_SIZE_U64)
                .map_err(FileError::Io)?;
            file.sync_all().map_err(FileError::Io)?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            total_pages,
            grown: false,
        })
    }

    /// Open `path`, creating it when missing. The flag is true if created.
    pub fn open_or_create(path: &Path) -> Result<(Self, bool), FileError> {
        match Self::create(path) {
            Ok(file) => Ok((file, true)),
            Err(FileError::AlreadyExists(_)) => Ok((Self::open(path)?, false)),
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of `page_id`, checked against the file length.
    const fn offset(&self, page_id: PageId) -> Result<u64, FileError> {
        if page_id >= self.total_pages {
            return Err(FileError::PageOutOfBounds {
                page_id,
                total_pages: self.total_pages,
            });
        }
        Ok(page_id * PAGE_SIZE_U64)
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Page, FileError> {
        let offset = self.offset(page_id)?;
        let mut page = Page::new();
        read_at(&self.file, page.as_bytes_mut(), offset).map_err(FileError::Io)?;
        Ok(page)
    }

    pub fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), FileError> {
        let offset = self.offset(page_id)?;
        write_at(&self.file, page.as_bytes(), offset).map_err(FileError::Io)
    }

    /// Extend the file by `count` zeroed pages. Returns the first new id.
    pub fn grow(&mut self, count: u64) -> Result<PageId, FileError> {
        let first = self.total_pages;
        let total = first + count;
        self.file
            .set_len(total * PAGE_SIZE_U64)
            .map_err(FileError::Io)?;
        self.total_pages = total;
        self.grown = true;
        Ok(first)
    }

    pub fn sync(&mut self) -> Result<(), FileError> {
        if self.grown {
            self.file.sync_all().map_err(FileError::Io)?;
            self.grown = false;
        } else {
            self.file.sync_data().map_err(FileError::Io)?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn read_at(mut file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(not(unix))]
fn write_at(mut file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// Page file errors.
#[derive(Debug)]
pub enum FileError {
    Io(std::io::Error),
    AlreadyExists(PathBuf),
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "page file I/O failed: {e}"),
            Self::AlreadyExists(p) => write!(f, "page file {} already exists", p.display()),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => write!(f, "page {page_id} is past the end of the file ({total_pages} pages)"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyExists(_) | Self::PageOutOfBounds { .. } => None,
        }
    }
}

impl From<FileError> for StorageError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Io(e) => Self::Io(e),
            FileError::PageOutOfBounds {
                page_id,
                total_pages,
            } => Self::PageOutOfBounds {
                page_id,
                total_pages,
            },
            FileError::AlreadyExists(path) => Self::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )),
        }
    }
}

impl Storage for PageFile {
    fn read_page(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        Ok(Self::read_page(self, page_id)?)
    }

    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        Ok(Self::write_page(self, page_id, page)?)
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(Self::sync(self)?)
    }

    fn allocate_pages(&mut self, count: u64) -> Result<PageId, StorageError> {
        Ok(self.grow(count)?)
    }

    fn total_pages(&self) -> u64 {
        self.total_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PAGE_SIZE;
    use std::fs;

    fn path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("quads.db")
    }

    #[test]
    fn test_open_or_create() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut file, created) = PageFile::open_or_create(&path(&dir)).expect("create");
        assert!(created);
        assert_eq!(file.grow(3).expect("grow"), 0);
        file.sync().expect("sync");
        drop(file);

        let (file, created) = PageFile::open_or_create(&path(&dir)).expect("open");
        assert!(!created);
        assert_eq!(file.total_pages(), 3);
        assert!(matches!(
            PageFile::create(&path(&dir)),
            Err(FileError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_pages_round_trip_and_new_pages_are_zeroed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = PageFile::create(&path(&dir)).expect("create");
        file.grow(5).expect("grow");

        let mut page = Page::new();
        page.write_u64(100, 0xDEAD_BEEF_CAFE_BABE);
        file.write_page(3, &page).expect("write");
        file.sync().expect("sync");
        drop(file);

        let file = PageFile::open(&path(&dir)).expect("open");
        assert_eq!(file.read_page(3).expect("read").read_u64(100), 0xDEAD_BEEF_CAFE_BABE);
        assert!(file.read_page(4).expect("read").is_zeroed());
    }

    #[test]
    fn test_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = PageFile::create(&path(&dir)).expect("create");
        assert!(matches!(
            file.read_page(0),
            Err(FileError::PageOutOfBounds { page_id: 0, total_pages: 0 })
        ));
        assert!(matches!(
            file.write_page(7, &Page::new()),
            Err(FileError::PageOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_partial_trailing_page_is_cut() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(path(&dir), vec![1u8; PAGE_SIZE * 2 + 100]).expect("write");

        let file = PageFile::open(&path(&dir)).expect("open");
        assert_eq!(file.total_pages(), 2);
        let len = fs::metadata(path(&dir)).expect("metadata").len();
        assert_eq!(len, 2 * PAGE_SIZE_U64);
    }
}
