//! Transaction manager.
//!
//! Owns the two root lists of the index set: the published committed state,
//! which readers snapshot, and the working roots the writer-slot holder
//! mutates. Between transactions both are equal.
//!
//! # Design
//!
//! - `NONE` and `READ_UNCOMMITTED` read the working trees. Their first
//!   write claims the writer slot without waiting, and writes go straight
//!   into the working trees.
//! - Every other level buffers writes in a [`Changeset`] and replays it onto
//!   the working trees at commit, after claiming the writer slot.
//! - `SNAPSHOT` and `SERIALIZABLE` read one committed state captured at
//!   `begin`; `READ_COMMITTED` and `SNAPSHOT_READ` take the latest committed
//!   state for each read operation.
//! - `SERIALIZABLE` commits validate against a log of the quads written by
//!   every commit since their snapshot.
//!
//! # Invariants
//!
//! - Only the writer-slot holder touches the working roots or calls into
//!   the page store's allocation state.
//! - A commit publishes the new state before it retires the pages the
//!   previous state used, so every reader that can still reach such a page
//!   registered before the retirement.
//! - A failed commit leaves the working roots equal to the committed ones.
//! - Reads of the working trees register as working readers, so the writer
//!   copies nodes instead of rewriting them under an open scan.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::dictionary::TermDictionary;
use crate::error::StoreError;
use crate::index::{QuadIndexSet, is_explicit};
use crate::iteration::Iteration;
use crate::namespaces::{NamespaceChanges, Namespaces};
use crate::storage::{CommitOutcome, PageId, ReaderGuard};
use crate::txn::changeset::Changeset;
use crate::txn::isolation::IsolationLevel;
use crate::txn::writer::{WriterGuard, WriterSlot};
use crate::types::{Quad, QuadPattern};

/// A published, durable state of the index set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedState {
    pub generation: u64,
    /// One root per configured permutation.
    pub roots: Vec<PageId>,
}

/// A committed state pinned for reading.
#[derive(Debug)]
pub struct Snapshot {
    state: Arc<CommittedState>,
    reader: ReaderGuard,
}

impl Snapshot {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.generation
    }
}

struct CommitRecord {
    generation: u64,
    quads: Vec<Quad>,
}

/// Quads written by recent commits, kept while a serializable transaction
/// with an older snapshot is active.
#[derive(Default)]
struct CommitLog {
    records: VecDeque<CommitRecord>,
    /// Snapshot generation -> active serializable transactions.
    active: BTreeMap<u64, usize>,
}

impl CommitLog {
    fn append(&mut self, generation: u64, quads: Vec<Quad>) {
        let Some(&oldest) = self.active.keys().next() else {
            self.records.clear();
            return;
        };
        self.records.push_back(CommitRecord { generation, quads });
        while self
            .records
            .front()
            .is_some_and(|record| record.generation <= oldest)
        {
            self.records.pop_front();
        }
    }

    fn register(&mut self, generation: u64) {
        *self.active.entry(generation).or_default() += 1;
    }

    fn unregister(&mut self, generation: u64) {
        if let Some(count) = self.active.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(&generation);
            }
        }
        if self.active.is_empty() {
            self.records.clear();
        }
    }
}

/// Keeps commit records newer than `generation` alive until dropped.
struct LogRegistration {
    log: Arc<Mutex<CommitLog>>,
    generation: u64,
}

impl Drop for LogRegistration {
    fn drop(&mut self) {
        let mut log = match self.log.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        };
        log.unregister(self.generation);
    }
}

/// One active transaction.
pub struct Transaction {
    level: IsolationLevel,
    id: u64,
    writer: Option<WriterGuard>,
    snapshot: Option<Snapshot>,
    registration: Option<LogRegistration>,
    changes: Changeset,
    namespaces: NamespaceChanges,
}

impl Transaction {
    fn new(level: IsolationLevel, id: u64) -> Self {
        Self {
            level,
            id,
            writer: None,
            snapshot: None,
            registration: None,
            changes: Changeset::new(level.has_fixed_snapshot()),
            namespaces: NamespaceChanges::default(),
        }
    }

    #[must_use]
    pub const fn level(&self) -> IsolationLevel {
        self.level
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Generation of the snapshot captured at `begin`, if the level has one.
    #[must_use]
    pub fn snapshot_generation(&self) -> Option<u64> {
        self.snapshot.as_ref().map(Snapshot::generation)
    }

    #[must_use]
    pub const fn changes(&self) -> &Changeset {
        &self.changes
    }

    #[must_use]
    pub const fn namespaces(&self) -> &NamespaceChanges {
        &self.namespaces
    }

    pub const fn namespaces_mut(&mut self) -> &mut NamespaceChanges {
        &mut self.namespaces
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("changes", &self.changes.len())
            .field("validated", &self.registration.is_some())
            .finish_non_exhaustive()
    }
}

/// Counters reported by [`TxnManager::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnStats {
    pub generation: u64,
    pub writer_held: bool,
    pub commit_log_records: usize,
    pub active_serializable: usize,
}

/// Coordinates transactions over one index set.
pub struct TxnManager {
    indexes: QuadIndexSet,
    dictionary: Arc<TermDictionary>,
    namespaces: Arc<Namespaces>,
    committed: RwLock<Arc<CommittedState>>,
    working: Mutex<Vec<PageId>>,
    writer: Arc<WriterSlot>,
    log: Arc<Mutex<CommitLog>>,
    lock_timeout: Duration,
    next_id: AtomicU64,
}

impl TxnManager {
    #[must_use]
    pub fn new(
        indexes: QuadIndexSet,
        dictionary: Arc<TermDictionary>,
        namespaces: Arc<Namespaces>,
        state: CommittedState,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            indexes,
            dictionary,
            namespaces,
            working: Mutex::new(state.roots.clone()),
            committed: RwLock::new(Arc::new(state)),
            writer: WriterSlot::new(),
            log: Arc::new(Mutex::new(CommitLog::default())),
            lock_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn indexes(&self) -> &QuadIndexSet {
        &self.indexes
    }

    #[must_use]
    pub const fn dictionary(&self) -> &Arc<TermDictionary> {
        &self.dictionary
    }

    #[must_use]
    pub const fn namespaces(&self) -> &Arc<Namespaces> {
        &self.namespaces
    }

    /// The latest published state.
    pub fn committed(&self) -> Result<Arc<CommittedState>, StoreError> {
        self.committed
            .read()
            .map(|state| Arc::clone(&state))
            .map_err(|_| StoreError::LockPoisoned)
    }

    fn working(&self) -> Result<MutexGuard<'_, Vec<PageId>>, StoreError> {
        self.working.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn log(&self) -> Result<MutexGuard<'_, CommitLog>, StoreError> {
        self.log.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn register_reader(&self) -> Result<ReaderGuard, StoreError> {
        Ok(self.indexes.context().reclaimer.register()?)
    }

    pub fn stats(&self) -> Result<TxnStats, StoreError> {
        let generation = self.committed()?.generation;
        let log = self.log()?;
        Ok(TxnStats {
            generation,
            writer_held: self.writer.holder().is_some(),
            commit_log_records: log.records.len(),
            active_serializable: log.active.values().sum(),
        })
    }

    /// Start a transaction at `level`.
    pub fn begin(&self, level: IsolationLevel) -> Result<Transaction, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut txn = Transaction::new(level, id);

        if level.has_fixed_snapshot() {
            let reader = self.register_reader()?;
            // The log lock orders this read of the committed state against
            // commits appending to the log.
            let mut log = self.log()?;
            let state = self.committed()?;
            if level == IsolationLevel::Serializable {
                log.register(state.generation);
                txn.registration = Some(LogRegistration {
                    log: Arc::clone(&self.log),
                    generation: state.generation,
                });
            }
            drop(log);
            txn.snapshot = Some(Snapshot { state, reader });
        }

        tracing::debug!(txn = id, %level, "began transaction");
        Ok(txn)
    }

    /// Claim the writer slot for a direct-level write, without waiting.
    fn claim_direct(&self, txn: &mut Transaction) -> Result<(), StoreError> {
        if txn.writer.is_some() {
            return Ok(());
        }
        let guard = self.writer.try_acquire(txn.id).ok_or_else(|| {
            let holder = self.writer.holder().map_or_else(
                || "another transaction".to_string(),
                |holder| format!("transaction {holder}"),
            );
            StoreError::IsolationConflict(format!(
                "{} writes in place but the writer slot is held by {holder}",
                txn.level
            ))
        })?;
        txn.writer = Some(guard);
        Ok(())
    }

    /// Roots a read in `txn` starts from, with the registration protecting
    /// them. `None` reads the latest committed state.
    fn base_view(
        &self,
        txn: Option<&Transaction>,
    ) -> Result<(Vec<PageId>, ReaderGuard), StoreError> {
        match txn {
            Some(txn) if txn.level.is_direct() => {
                let reader = self.indexes.context().reclaimer.register_working()?;
                let roots = self.working()?.clone();
                Ok((roots, reader))
            }
            Some(Transaction {
                snapshot: Some(snapshot),
                ..
            }) => Ok((snapshot.state.roots.clone(), snapshot.reader.fork()?)),
            _ => {
                let reader = self.register_reader()?;
                let state = self.committed()?;
                Ok((state.roots.clone(), reader))
            }
        }
    }

    fn base_flags(&self, txn: &Transaction, quad: &Quad) -> Result<Option<u8>, StoreError> {
        let (roots, _reader) = self.base_view(Some(txn))?;
        Ok(self.indexes.get(&roots, quad)?)
    }

    /// Quads matching `pattern` as `txn` sees them, with their flags.
    ///
    /// The iteration holds its own reader registration and stays valid
    /// after the transaction ends.
    pub fn scan(
        &self,
        txn: Option<&mut Transaction>,
        pattern: QuadPattern,
    ) -> Result<Iteration<(Quad, u8), StoreError>, StoreError> {
        let Some(txn) = txn else {
            let (roots, reader) = self.base_view(None)?;
            return Ok(Iteration::new(self.indexes.scan(&roots, pattern, Some(reader))).err_into());
        };
        if txn.level == IsolationLevel::Serializable {
            txn.changes.observe(pattern);
        }

        let (roots, reader) = self.base_view(Some(&*txn))?;
        let base: Iteration<(Quad, u8), StoreError> =
            Iteration::new(self.indexes.scan(&roots, pattern, Some(reader))).err_into();
        if txn.level.is_direct() || txn.changes.is_empty() {
            return Ok(base);
        }

        let touched: BTreeMap<Quad, Option<u8>> = txn
            .changes
            .matching(&pattern)
            .map(|(quad, entry)| (*quad, entry.current))
            .collect();
        let added: Vec<(Quad, u8)> = touched
            .iter()
            .filter_map(|(quad, current)| current.map(|flags| (*quad, flags)))
            .collect();
        let unchanged = base.filter_map(move |(quad, flags)| {
            Ok((!touched.contains_key(&quad)).then_some((quad, flags)))
        });
        Ok(unchanged.union(vec![Iteration::from_vec(added)]))
    }

    /// Add `quad` in `txn`. Returns whether the transaction's view changed.
    pub fn insert(
        &self,
        txn: &mut Transaction,
        quad: Quad,
        explicit: bool,
    ) -> Result<bool, StoreError> {
        if txn.level.is_direct() {
            self.claim_direct(txn)?;
            let mut working = self.working()?;
            let previous = self.indexes.insert(&mut working, &quad, explicit)?;
            let changed = previous.is_none_or(|flags| explicit && !is_explicit(flags));
            if changed {
                txn.changes.record_direct(quad);
            }
            return Ok(changed);
        }
        let base = self.base_flags(txn, &quad)?;
        Ok(txn.changes.add(quad, base, explicit))
    }

    /// Remove `quad` in `txn` if its kind matches `explicit`.
    pub fn remove(
        &self,
        txn: &mut Transaction,
        quad: Quad,
        explicit: bool,
    ) -> Result<bool, StoreError> {
        if txn.level.is_direct() {
            self.claim_direct(txn)?;
            let mut working = self.working()?;
            let removed = self.indexes.remove(&mut working, &quad, explicit)?;
            if removed {
                txn.changes.record_direct(quad);
            }
            return Ok(removed);
        }
        let base = self.base_flags(txn, &quad)?;
        Ok(txn.changes.remove(quad, base, explicit))
    }

    /// Remove every quad of the given kind matching `pattern`.
    ///
    /// Matches are collected `batch_size` at a time, so memory stays bounded
    /// however many quads match. `on_removed` sees each removed quad.
    pub fn remove_matching(
        &self,
        txn: &mut Transaction,
        pattern: QuadPattern,
        explicit: bool,
        batch_size: usize,
        mut on_removed: impl FnMut(&Quad) -> Result<(), StoreError>,
    ) -> Result<u64, StoreError> {
        let batch_size = batch_size.max(1);
        let mut removed = 0;
        loop {
            let mut batch = Vec::new();
            let mut matches = self.scan(Some(&mut *txn), pattern)?;
            while batch.len() < batch_size {
                let Some(item) = matches.next() else { break };
                let (quad, flags) = item?;
                if is_explicit(flags) == explicit {
                    batch.push(quad);
                }
            }
            drop(matches);

            let full = batch.len() == batch_size;
            for quad in batch {
                if self.remove(txn, quad, explicit)? {
                    removed += 1;
                    on_removed(&quad)?;
                }
            }
            if !full {
                return Ok(removed);
            }
        }
    }

    /// Make `txn` durable and visible.
    pub fn commit(&self, mut txn: Transaction) -> Result<(), StoreError> {
        let _writer = match txn.writer.take() {
            Some(guard) => guard,
            None if txn.changes.is_empty() && txn.namespaces.is_empty() => {
                tracing::debug!(txn = txn.id, "committed read-only transaction");
                return Ok(());
            }
            None => self
                .writer
                .acquire(txn.id, self.lock_timeout)
                .ok_or_else(|| {
                    StoreError::IsolationConflict(format!(
                        "writer slot not free after {:?}",
                        self.lock_timeout
                    ))
                })?,
        };

        if txn.level == IsolationLevel::Serializable
            && let Some(since) = txn.snapshot_generation()
        {
            self.validate(&txn, since)?;
        }

        let mut working = self.working()?;
        let committed = self.committed()?;
        if !txn.level.is_direct()
            && let Err(e) = self.apply(&mut working, &txn.changes)
        {
            self.abandon(&mut working, &committed);
            return Err(e);
        }

        let outcome = match self.persist(&working, &committed, &txn.namespaces) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                tracing::debug!(txn = txn.id, "committed without index changes");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(txn = txn.id, "commit failed: {e}");
                self.abandon(&mut working, &committed);
                return Err(e);
            }
        };

        let state = Arc::new(CommittedState {
            generation: outcome.superblock.generation,
            roots: working.clone(),
        });
        *self.committed.write().map_err(|_| StoreError::LockPoisoned)? = Arc::clone(&state);
        drop(working);

        let ctx = self.indexes.context();
        ctx.reclaimer.retire(outcome.retired)?;
        ctx.reclaimer.reclaim(&ctx.cache)?;
        self.log()?.append(state.generation, txn.changes.written());

        tracing::debug!(
            txn = txn.id,
            level = %txn.level,
            generation = state.generation,
            "committed transaction"
        );
        Ok(())
    }

    /// Discard `txn`. Working trees changed in place are reset.
    pub fn rollback(&self, mut txn: Transaction) -> Result<(), StoreError> {
        if let Some(writer) = txn.writer.take() {
            let committed = self.committed()?;
            let mut working = self.working()?;
            self.abandon(&mut working, &committed);
            drop(working);
            drop(writer);
        }
        tracing::debug!(txn = txn.id, level = %txn.level, "rolled back transaction");
        Ok(())
    }

    fn validate(&self, txn: &Transaction, since: u64) -> Result<(), StoreError> {
        let log = self.log()?;
        for record in log.records.iter().filter(|r| r.generation > since) {
            if let Some(quad) = txn.changes.conflict_with(&record.quads) {
                tracing::debug!(
                    txn = txn.id,
                    snapshot = since,
                    conflicting_generation = record.generation,
                    "serializable validation failed"
                );
                return Err(StoreError::SerializationConflict(format!(
                    "{quad:?} was changed by generation {} after snapshot {since}",
                    record.generation
                )));
            }
        }
        Ok(())
    }

    /// Replay a changeset onto the working trees.
    ///
    /// Each entry's wanted state is written over whatever the working trees
    /// hold, so entries whose base moved since they were created still land.
    fn apply(&self, working: &mut [PageId], changes: &Changeset) -> Result<(), StoreError> {
        for (quad, entry) in changes.entries() {
            let stored = self.indexes.get(working, quad)?;
            match (stored, entry.current) {
                (Some(flags), None) => {
                    // Only the kind the transaction removed goes away.
                    let explicit = entry.base.map_or(is_explicit(flags), is_explicit);
                    self.indexes.remove(working, quad, explicit)?;
                }
                (stored, Some(flags)) => {
                    let explicit = is_explicit(flags);
                    // Removing an explicit quad and re-adding it as inferred
                    // must replace the stored flags, not merge into them.
                    if !explicit
                        && stored.is_some_and(is_explicit)
                        && entry.base.is_some_and(is_explicit)
                    {
                        self.indexes.remove(working, quad, true)?;
                    }
                    self.indexes.insert(working, quad, explicit)?;
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    /// Everything up to and including the page store commit.
    fn persist(
        &self,
        working: &[PageId],
        committed: &CommittedState,
        namespaces: &NamespaceChanges,
    ) -> Result<Option<CommitOutcome>, StoreError> {
        self.dictionary.sync()?;
        self.namespaces.apply(namespaces)?;
        if working == committed.roots.as_slice() {
            return Ok(None);
        }

        let ctx = self.indexes.context();
        ctx.cache.flush()?;
        let deferred = ctx.reclaimer.pending()?;
        let outcome = ctx.cache.pager().commit(
            self.indexes.index_roots(working),
            self.dictionary.len()?,
            &deferred,
        )?;
        Ok(Some(outcome))
    }

    /// Reset the working roots to `committed` and queue the pages the
    /// abandoned writes allocated.
    fn abandon(&self, working: &mut Vec<PageId>, committed: &CommittedState) {
        let ctx = self.indexes.context();
        match ctx.cache.pager().rollback() {
            Ok(fresh) => {
                if let Err(e) = ctx.reclaimer.retire(fresh) {
                    tracing::warn!("could not queue abandoned pages: {e}");
                }
            }
            Err(e) => tracing::warn!("page store rollback failed: {e}"),
        }
        working.clone_from(&committed.roots);
    }
}
