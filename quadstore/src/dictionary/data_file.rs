//! The two append-only dictionary files.
//!
//! `terms.dat` holds one record per term: `[len u32][crc32 u32][bytes]`.
//! `terms.idx` holds one 16-byte entry per id: `[offset u64][hash u32][len u32]`,
//! where entry `n` describes id `n + 1`. Records are appended to the data
//! file before their index entry, so a crash can leave a record without an
//! entry (dropped on open) but never an entry without its record, once both
//! files were synced.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::dictionary::DictionaryError;

/// Data file name inside the store directory.
pub const DATA_FILE_NAME: &str = "terms.dat";

/// Index file name inside the store directory.
pub const INDEX_FILE_NAME: &str = "terms.idx";

const RECORD_HEADER_SIZE: u64 = 8;
const INDEX_ENTRY_SIZE: u64 = 16;

/// Location of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub hash: u32,
    pub len: u32,
}

impl IndexEntry {
    fn to_bytes(self) -> [u8; INDEX_ENTRY_SIZE as usize] {
        let mut bytes = [0u8; INDEX_ENTRY_SIZE as usize];
        bytes[0..8].copy_from_slice(&self.offset.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.hash.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.len.to_be_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut offset = [0u8; 8];
        let mut hash = [0u8; 4];
        let mut len = [0u8; 4];
        offset.copy_from_slice(&bytes[0..8]);
        hash.copy_from_slice(&bytes[8..12]);
        len.copy_from_slice(&bytes[12..16]);
        Self {
            offset: u64::from_be_bytes(offset),
            hash: u32::from_be_bytes(hash),
            len: u32::from_be_bytes(len),
        }
    }

    const fn end(&self) -> u64 {
        self.offset + RECORD_HEADER_SIZE + self.len as u64
    }
}

/// Open handles on `terms.dat` and `terms.idx`.
pub struct TermFiles {
    data: File,
    index: File,
    data_len: u64,
    entries: Vec<IndexEntry>,
}

/// What `open` had to cut off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Repair {
    pub dropped_index_bytes: u64,
    pub dropped_data_bytes: u64,
}

impl Repair {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.dropped_index_bytes == 0 && self.dropped_data_bytes == 0
    }
}

impl TermFiles {
    /// Open or create both files in `dir`, truncating torn tails.
    pub fn open(dir: &Path) -> Result<(Self, Repair), DictionaryError> {
        let open = |name: &str| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.join(name))
        };
        let mut data = open(DATA_FILE_NAME)?;
        let mut index = open(INDEX_FILE_NAME)?;
        let data_file_len = data.metadata()?.len();
        let index_file_len = index.metadata()?.len();

        let mut raw = Vec::new();
        index.seek(SeekFrom::Start(0))?;
        index.read_to_end(&mut raw)?;
        let mut entries: Vec<IndexEntry> = raw
            .chunks_exact(INDEX_ENTRY_SIZE as usize)
            .map(IndexEntry::from_bytes)
            .collect();

        // Entries must describe consecutive records that fit in the data file.
        let mut expected_offset = 0;
        let valid = entries
            .iter()
            .take_while(|entry| {
                let ok = entry.offset == expected_offset && entry.end() <= data_file_len;
                expected_offset = entry.end();
                ok
            })
            .count();
        entries.truncate(valid);

        let data_len = entries.last().map_or(0, IndexEntry::end);
        let index_len = entries.len() as u64 * INDEX_ENTRY_SIZE;
        let repair = Repair {
            dropped_index_bytes: index_file_len - index_len,
            dropped_data_bytes: data_file_len - data_len,
        };
        if !repair.is_clean() {
            index.set_len(index_len)?;
            data.set_len(data_len)?;
            index.sync_all()?;
            data.sync_all()?;
        }

        Ok((
            Self {
                data,
                index,
                data_len,
                entries,
            },
            repair,
        ))
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Append a record and its index entry. Returns the entry position.
    pub fn append(&mut self, bytes: &[u8], hash: u32) -> Result<usize, DictionaryError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| DictionaryError::TermTooLarge { size: bytes.len() })?;
        let entry = IndexEntry {
            offset: self.data_len,
            hash,
            len,
        };

        let mut record = Vec::with_capacity(bytes.len() + RECORD_HEADER_SIZE as usize);
        record.extend_from_slice(&len.to_be_bytes());
        record.extend_from_slice(&crc32fast::hash(bytes).to_be_bytes());
        record.extend_from_slice(bytes);
        self.data.seek(SeekFrom::Start(entry.offset))?;
        self.data.write_all(&record)?;

        let index_offset = self.entries.len() as u64 * INDEX_ENTRY_SIZE;
        self.index.seek(SeekFrom::Start(index_offset))?;
        self.index.write_all(&entry.to_bytes())?;

        self.data_len = entry.end();
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    /// Read and verify the record at entry `position`.
    pub fn read(&mut self, position: usize) -> Result<Vec<u8>, DictionaryError> {
        let entry = *self
            .entries
            .get(position)
            .ok_or_else(|| DictionaryError::Corruption(format!("no index entry {position}")))?;
        let mut record = vec![0u8; RECORD_HEADER_SIZE as usize + entry.len as usize];

        #[cfg(unix)]
        {
            self.data.read_exact_at(&mut record, entry.offset)?;
        }
        #[cfg(not(unix))]
        {
            self.data.seek(SeekFrom::Start(entry.offset))?;
            self.data.read_exact(&mut record)?;
        }

        let mut header = [0u8; 4];
        header.copy_from_slice(&record[0..4]);
        let len = u32::from_be_bytes(header);
        header.copy_from_slice(&record[4..8]);
        let crc = u32::from_be_bytes(header);
        let bytes = record.split_off(RECORD_HEADER_SIZE as usize);
        if len != entry.len || crc != crc32fast::hash(&bytes) {
            return Err(DictionaryError::Corruption(format!(
                "checksum mismatch in term record at offset {}",
                entry.offset
            )));
        }
        Ok(bytes)
    }

    /// Force both files, data first.
    pub fn sync(&self) -> Result<(), DictionaryError> {
        self.data.sync_all()?;
        self.index.sync_all()?;
        Ok(())
    }
}
