//! Term dictionary: maps RDF terms to stable integer ids and back.
//!
//! # Design
//!
//! - Terms are content addressed: the canonical encoding ([`codec`]) is
//!   hashed with crc32 and probed against an in-memory hash table built from
//!   `terms.idx` at open. Colliding candidates are compared byte for byte.
//! - Ids are dense: the n-th record appended gets id `n` (starting at 1).
//!   Id 0 is the default-graph sentinel and is never assigned.
//! - Two caches sit in front of the files: id to term (`value_cache_size`)
//!   and encoding to id (`value_id_cache_size`). Entries idle for longer
//!   than the eviction interval are dropped by a sweep that runs at most
//!   once per interval.
//! - Appends are not forced until [`TermDictionary::sync`], which the
//!   transaction manager calls before the page store commit. A term id is
//!   therefore durable before any committed quad refers to it.
//!
//! # Invariants
//!
//! - A term has exactly one id for the lifetime of the store.
//! - `resolve(get_or_create_id(t)) == t` after normalization.

pub mod cache;
pub mod codec;
pub mod data_file;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::types::{Term, TermId};
use cache::LruCache;
use data_file::TermFiles;

pub use codec::MAX_TERM_SIZE;

/// Default number of cached id to term entries.
pub const DEFAULT_VALUE_CACHE_SIZE: usize = 512;

/// Default number of cached term to id entries.
pub const DEFAULT_VALUE_ID_CACHE_SIZE: usize = 128;

/// Default idle time after which cache entries are dropped.
pub const DEFAULT_VALUE_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Tuning for the dictionary caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryOptions {
    pub value_cache_size: usize,
    pub value_id_cache_size: usize,
    /// Zero disables idle eviction.
    pub eviction_interval: Duration,
}

impl Default for DictionaryOptions {
    fn default() -> Self {
        Self {
            value_cache_size: DEFAULT_VALUE_CACHE_SIZE,
            value_id_cache_size: DEFAULT_VALUE_ID_CACHE_SIZE,
            eviction_interval: DEFAULT_VALUE_EVICTION_INTERVAL,
        }
    }
}

/// Dictionary counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DictionaryStats {
    pub terms: u64,
    pub cached_values: usize,
    pub cached_ids: usize,
}

struct DictState {
    files: TermFiles,
    by_hash: HashMap<u32, Vec<TermId>>,
    values: LruCache<TermId, Term>,
    ids: LruCache<Vec<u8>, TermId>,
    last_sweep: Instant,
}

impl DictState {
    fn maybe_sweep(&mut self, interval: Duration) {
        if interval.is_zero() || self.last_sweep.elapsed() < interval {
            return;
        }
        let dropped = self.values.sweep(interval) + self.ids.sweep(interval);
        self.last_sweep = Instant::now();
        if dropped > 0 {
            tracing::debug!(dropped, "evicted idle dictionary cache entries");
        }
    }

    /// Find the id of an encoded term without assigning one.
    fn probe(&mut self, bytes: &[u8], hash: u32) -> Result<Option<TermId>, DictionaryError> {
        if let Some(id) = self.ids.get(&bytes.to_vec()) {
            return Ok(Some(id));
        }
        let candidates = self.by_hash.get(&hash).cloned().unwrap_or_default();
        for id in candidates {
            if self.files.read(position(id)?)? == bytes {
                self.ids.insert(bytes.to_vec(), id);
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}

fn position(id: TermId) -> Result<usize, DictionaryError> {
    id.0.checked_sub(1)
        .and_then(|p| usize::try_from(p).ok())
        .ok_or(DictionaryError::NotFound(id))
}

/// The term dictionary of one store.
pub struct TermDictionary {
    state: Mutex<DictState>,
    options: DictionaryOptions,
}

impl TermDictionary {
    /// Open (or create) the dictionary files in `dir`.
    ///
    /// Torn tails left by a crash are truncated and logged.
    pub fn open(dir: &Path, options: DictionaryOptions) -> Result<Self, DictionaryError> {
        let (files, repair) = TermFiles::open(dir)?;
        if !repair.is_clean() {
            tracing::warn!(
                dropped_index_bytes = repair.dropped_index_bytes,
                dropped_data_bytes = repair.dropped_data_bytes,
                "truncated torn dictionary tail"
            );
        }

        let mut by_hash: HashMap<u32, Vec<TermId>> = HashMap::new();
        for (i, entry) in files.entries().iter().enumerate() {
            by_hash
                .entry(entry.hash)
                .or_default()
                .push(TermId(i as u64 + 1));
        }
        tracing::info!(terms = files.len(), "opened term dictionary");

        Ok(Self {
            state: Mutex::new(DictState {
                files,
                by_hash,
                values: LruCache::new(options.value_cache_size),
                ids: LruCache::new(options.value_id_cache_size),
                last_sweep: Instant::now(),
            }),
            options,
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, DictState>, DictionaryError> {
        self.state.lock().map_err(|_| DictionaryError::LockPoisoned)
    }

    /// Id of `term`, assigning the next id if the term is new.
    pub fn get_or_create_id(&self, term: &Term) -> Result<TermId, DictionaryError> {
        let bytes = codec::encode(term)?;
        let hash = crc32fast::hash(&bytes);
        let mut state = self.state()?;
        state.maybe_sweep(self.options.eviction_interval);
        if let Some(id) = state.probe(&bytes, hash)? {
            return Ok(id);
        }

        let position = state.files.append(&bytes, hash)?;
        let id = TermId(position as u64 + 1);
        state.by_hash.entry(hash).or_default().push(id);
        state.ids.insert(bytes, id);
        Ok(id)
    }

    /// Id of `term` if it has one. Never writes.
    pub fn lookup_id(&self, term: &Term) -> Result<Option<TermId>, DictionaryError> {
        let bytes = codec::encode(term)?;
        let hash = crc32fast::hash(&bytes);
        let mut state = self.state()?;
        state.maybe_sweep(self.options.eviction_interval);
        state.probe(&bytes, hash)
    }

    /// The term with id `id`.
    ///
    /// An id that was never assigned is a consistency fault: quads only
    /// refer to ids the dictionary handed out.
    pub fn resolve(&self, id: TermId) -> Result<Term, DictionaryError> {
        let mut state = self.state()?;
        state.maybe_sweep(self.options.eviction_interval);
        if let Some(term) = state.values.get(&id) {
            return Ok(term);
        }
        let position = position(id)?;
        if position >= state.files.len() {
            return Err(DictionaryError::NotFound(id));
        }
        let term = codec::decode(&state.files.read(position)?)?;
        state.values.insert(id, term.clone());
        Ok(term)
    }

    /// Number of assigned ids.
    pub fn len(&self) -> Result<u64, DictionaryError> {
        Ok(self.state()?.files.len() as u64)
    }

    pub fn is_empty(&self) -> Result<bool, DictionaryError> {
        Ok(self.len()? == 0)
    }

    /// Force both dictionary files to disk.
    pub fn sync(&self) -> Result<(), DictionaryError> {
        self.state()?.files.sync()
    }

    pub fn stats(&self) -> Result<DictionaryStats, DictionaryError> {
        let state = self.state()?;
        Ok(DictionaryStats {
            terms: state.files.len() as u64,
            cached_values: state.values.len(),
            cached_ids: state.ids.len(),
        })
    }
}

/// Errors that can occur in the term dictionary.
#[derive(Debug)]
pub enum DictionaryError {
    /// I/O error on `terms.dat` or `terms.idx`.
    Io(std::io::Error),
    /// A record failed its checksum or could not be decoded.
    Corruption(String),
    /// No term has this id.
    NotFound(TermId),
    /// The encoded term exceeds [`MAX_TERM_SIZE`].
    TermTooLarge { size: usize },
    /// The term cannot be stored (e.g. an empty language tag).
    InvalidTerm(String),
    /// Internal lock poisoned.
    LockPoisoned,
}

impl std::fmt::Display for DictionaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "dictionary I/O error: {e}"),
            Self::Corruption(msg) => write!(f, "dictionary corruption: {msg}"),
            Self::NotFound(id) => write!(f, "no term with id {id}"),
            Self::TermTooLarge { size } => write!(
                f,
                "term of {size} bytes exceeds the {MAX_TERM_SIZE} byte limit"
            ),
            Self::InvalidTerm(msg) => write!(f, "invalid term: {msg}"),
            Self::LockPoisoned => write!(f, "dictionary lock poisoned"),
        }
    }
}

impl std::error::Error for DictionaryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DictionaryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
