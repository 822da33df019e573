//! Opening and closing a store.
//!
//! A store directory holds four files:
//!
//! - `quads.db`: the page file with every index tree
//! - `terms.dat` and `terms.idx`: the term dictionary
//! - `namespaces.dat`: the namespace prefixes
//!
//! # Invariants
//!
//! - The dictionary always holds at least as many terms as the durable
//!   superblock records; a shorter dictionary means the files do not
//!   belong together.
//! - After `open` returns, the stored index trees match the configured
//!   permutations.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::connection::Connection;
use crate::dictionary::{DictionaryStats, TermDictionary};
use crate::error::StoreError;
use crate::index::QuadIndexSet;
use crate::namespaces::Namespaces;
use crate::observer::{Listeners, StoreListener};
use crate::storage::btree::TreeContext;
use crate::storage::{
    PageFile, IndexRoot, NodeCache, NodeCacheStats, PageId, PageStore, PagerStats, Reclaimer,
    Storage, StorageError,
};
use crate::txn::{CommittedState, TxnManager, TxnStats};

/// Page file name inside the store directory.
pub const PAGE_FILE_NAME: &str = "quads.db";

/// State shared by a store and its connections.
pub(crate) struct StoreShared {
    pub(crate) config: StoreConfig,
    pub(crate) manager: TxnManager,
    pub(crate) listeners: Listeners,
    closed: AtomicBool,
}

impl StoreShared {
    pub(crate) fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

/// Space and cache figures of an open store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Committed quads, explicit and inferred.
    pub quads: u64,
    pub pager: PagerStats,
    pub cache: NodeCacheStats,
    pub dictionary: DictionaryStats,
    pub transactions: TxnStats,
    pub active_readers: usize,
    pub pending_pages: usize,
}

/// An open quad store.
pub struct QuadStore {
    shared: Arc<StoreShared>,
}

impl QuadStore {
    /// Open the store in `config.data_dir`, creating it if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.data_dir).map_err(StorageError::Io)?;
        let path = config.data_dir.join(PAGE_FILE_NAME);
        let (file, created) = PageFile::open_or_create(&path).map_err(StorageError::from)?;
        if created {
            tracing::info!("creating store in {}", config.data_dir.display());
        }
        Self::open_with_storage(config, Box::new(file))
    }

    /// Open a store whose page file is `storage`. The dictionary and
    /// namespace files still live in `config.data_dir`.
    pub fn open_with_storage(
        config: StoreConfig,
        storage: Box<dyn Storage + Send>,
    ) -> Result<Self, StoreError> {
        let permutations = config.permutations()?;
        fs::create_dir_all(&config.data_dir).map_err(StorageError::Io)?;
        let dictionary = TermDictionary::open(&config.data_dir, config.dictionary_options())?;
        let namespaces = Namespaces::open(&config.data_dir, config.force_sync)?;

        let pager = if storage.total_pages() == 0 {
            let indexes = permutations
                .iter()
                .map(|permutation| IndexRoot {
                    name: permutation.name(),
                    root: 0,
                })
                .collect();
            PageStore::create(storage, indexes, config.pager_options())?
        } else {
            PageStore::open(storage, config.pager_options())?
        };
        let superblock = pager.superblock()?;

        let terms = dictionary.len()?;
        if terms < superblock.term_count {
            return Err(StoreError::Corruption(format!(
                "dictionary holds {terms} terms but generation {} references {}",
                superblock.generation, superblock.term_count
            )));
        }

        let ctx = TreeContext {
            cache: NodeCache::new(
                Arc::new(pager),
                config.node_cache_size,
                config.node_cache_min_released,
            ),
            reclaimer: Reclaimer::new(),
            fanout: config.btree_fanout,
        };
        let indexes = QuadIndexSet::new(permutations, ctx);
        let (roots, changed) = indexes.reconcile(&superblock.indexes)?;
        let generation = if changed {
            commit_reindex(&indexes, &roots, terms)?
        } else {
            superblock.generation
        };

        let manager = TxnManager::new(
            indexes,
            Arc::new(dictionary),
            Arc::new(namespaces),
            CommittedState { generation, roots },
            config.lock_timeout,
        );
        tracing::info!(
            generation,
            terms,
            indexes = %config.triple_indexes,
            "opened store in {}",
            config.data_dir.display()
        );

        Ok(Self {
            shared: Arc::new(StoreShared {
                config,
                manager,
                listeners: Listeners::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// A new connection. Each connection runs at most one transaction.
    pub fn connection(&self) -> Result<Connection, StoreError> {
        self.shared.check_open()?;
        Ok(Connection::new(Arc::clone(&self.shared)))
    }

    pub fn add_listener(&self, listener: Arc<dyn StoreListener>) {
        self.shared.listeners.add(listener);
    }

    /// Returns whether `listener` was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn StoreListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let manager = &self.shared.manager;
        let ctx = manager.indexes().context();
        let reader = ctx.reclaimer.register()?;
        let committed = manager.committed()?;
        let quads = manager.indexes().count(&committed.roots)?;
        drop(reader);
        Ok(StoreStats {
            quads,
            pager: ctx.cache.pager().stats()?,
            cache: ctx.cache.stats()?,
            dictionary: manager.dictionary().stats()?,
            transactions: manager.stats()?,
            active_readers: ctx.reclaimer.active_readers()?,
            pending_pages: ctx.reclaimer.pending()?.len(),
        })
    }

    /// Refuse further work and force the dictionary to disk.
    ///
    /// Connections still open fail with [`StoreError::Closed`] afterwards.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.manager.dictionary().sync()?;
        let generation = self.shared.manager.committed()?.generation;
        tracing::info!(
            generation,
            "closed store in {}",
            self.shared.config.data_dir.display()
        );
        Ok(())
    }
}

impl Drop for QuadStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing store failed: {e}");
        }
    }
}

/// Make a re-indexed root list durable before any transaction runs.
fn commit_reindex(
    indexes: &QuadIndexSet,
    roots: &[PageId],
    term_count: u64,
) -> Result<u64, StoreError> {
    let ctx = indexes.context();
    ctx.cache.flush()?;
    let outcome = ctx.cache.pager().commit(
        indexes.index_roots(roots),
        term_count,
        &ctx.reclaimer.pending()?,
    )?;
    ctx.reclaimer.retire(outcome.retired)?;
    ctx.reclaimer.reclaim(&ctx.cache)?;
    tracing::info!(
        generation = outcome.superblock.generation,
        "committed re-indexed store"
    );
    Ok(outcome.superblock.generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{QuadConnection, has_statement, in_transaction};
    use crate::simulation::SimulatedStorage;
    use crate::storage::btree::BTree;
    use crate::txn::IsolationLevel;
    use crate::types::{Statement, Term};
    use std::sync::Mutex;
    use std::time::Duration;

    fn iri(name: &str) -> Term {
        Term::iri(format!("http://example.org/{name}"))
    }

    fn small(dir: &std::path::Path) -> StoreConfig {
        StoreConfig::new(dir)
            .with_btree_fanout(4)
            .with_node_cache_size(64)
            .with_node_cache_min_released(4)
            .with_force_sync(true)
    }

    fn add(conn: &mut Connection, s: &str, p: &str, o: &str) {
        conn.add_statement(&iri(s), &iri(p), &iri(o), &[])
            .expect("add");
    }

    #[test]
    fn test_statements_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = QuadStore::open(small(dir.path())).expect("open");
            let mut conn = store.connection().expect("connection");
            conn.begin(IsolationLevel::SnapshotRead).expect("begin");
            for i in 0..50 {
                add(&mut conn, &format!("s{i}"), "knows", &format!("o{}", i % 7));
            }
            conn.add_statement(
                &iri("s0"),
                &iri("name"),
                &Term::lang_literal("Zero", "EN"),
                &[Some(iri("graph"))],
            )
            .expect("add literal");
            conn.commit().expect("commit");
            store.close().expect("close");
        }

        let store = QuadStore::open(small(dir.path())).expect("reopen");
        let mut conn = store.connection().expect("connection");
        assert_eq!(conn.size(&[]).expect("size"), 51);
        let named = conn
            .get_statements(Some(&iri("s0")), Some(&iri("name")), None, true, &[])
            .expect("get")
            .collect_all()
            .expect("collect");
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].object, Term::lang_literal("Zero", "en"));
        assert_eq!(named[0].context, Some(iri("graph")));
        assert!(dir.path().join(PAGE_FILE_NAME).exists());
    }

    #[test]
    fn test_duplicate_adds_do_not_change_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open(small(dir.path())).expect("open");
        let mut conn = store.connection().expect("connection");
        for level in [IsolationLevel::None, IsolationLevel::Serializable] {
            conn.begin(level).expect("begin");
            add(&mut conn, "a", "p", "b");
            add(&mut conn, "a", "p", "b");
            conn.commit().expect("commit");
            assert_eq!(conn.size(&[]).expect("size"), 1);
        }
    }

    #[test]
    fn test_crash_before_superblock_keeps_previous_generation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = SimulatedStorage::new(21);
        let disk = storage.handle();
        let store = QuadStore::open_with_storage(small(dir.path()), Box::new(storage))
            .expect("open");
        let mut conn = store.connection().expect("connection");
        conn.begin(IsolationLevel::SnapshotRead).expect("begin");
        for i in 0..20 {
            add(&mut conn, &format!("s{i}"), "p", "o");
        }
        conn.commit().expect("first commit");

        conn.begin(IsolationLevel::SnapshotRead).expect("begin");
        for i in 20..80 {
            add(&mut conn, &format!("s{i}"), "p", "o");
        }
        // The sync before the superblock write fails.
        disk.fail_syncs_after(0, 1);
        let err = conn.commit().expect_err("sync fails");
        assert!(!err.is_conflict());
        drop(conn);
        drop(store);

        let recovered = disk.crash();
        let store = QuadStore::open_with_storage(small(dir.path()), Box::new(recovered))
            .expect("reopen after crash");
        let mut conn = store.connection().expect("connection");
        assert_eq!(conn.size(&[]).expect("size"), 20);
        let stats = store.stats().expect("stats");
        assert_eq!(stats.quads, 20);
    }

    #[test]
    fn test_crash_after_commit_keeps_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = SimulatedStorage::new(5);
        let disk = storage.handle();
        let store = QuadStore::open_with_storage(small(dir.path()), Box::new(storage))
            .expect("open");
        let mut conn = store.connection().expect("connection");
        in_transaction(&mut conn, IsolationLevel::Snapshot, |conn| {
            for i in 0..30 {
                add(conn, &format!("s{i}"), "p", "o");
            }
            Ok(())
        })
        .expect("transaction");
        assert_eq!(disk.pending_writes(), 0);
        drop(conn);
        drop(store);

        let store = QuadStore::open_with_storage(small(dir.path()), Box::new(disk.crash()))
            .expect("reopen");
        let mut conn = store.connection().expect("connection");
        assert_eq!(conn.size(&[]).expect("size"), 30);
    }

    #[test]
    fn test_freed_pages_are_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open_with_storage(
            small(dir.path()),
            Box::new(SimulatedStorage::new(8)),
        )
        .expect("open");
        let mut conn = store.connection().expect("connection");
        let mut after_first_round = 0;
        for round in 0..6 {
            conn.begin(IsolationLevel::None).expect("begin");
            for i in 0..40 {
                add(&mut conn, &format!("s{i}"), "p", &format!("o{round}"));
            }
            conn.commit().expect("commit");
            conn.begin(IsolationLevel::None).expect("begin");
            assert_eq!(
                conn.remove_statements(None, None, None, &[]).expect("remove"),
                40
            );
            conn.commit().expect("commit");
            if round == 0 {
                after_first_round = store.stats().expect("stats").pager.total_pages;
            }
        }
        let stats = store.stats().expect("stats");
        assert_eq!(stats.quads, 0);
        assert_eq!(stats.pending_pages, 0);
        // Pages released by earlier rounds were reused instead of growing
        // the file every round.
        assert!(
            stats.pager.total_pages <= 2 * after_first_round,
            "{} pages after six rounds, {after_first_round} after one",
            stats.pager.total_pages
        );
    }

    #[test]
    fn test_reindex_on_permutation_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = QuadStore::open(small(dir.path())).expect("open");
            let mut conn = store.connection().expect("connection");
            conn.begin(IsolationLevel::Snapshot).expect("begin");
            for i in 0..25 {
                add(&mut conn, &format!("s{i}"), &format!("p{}", i % 3), "o");
            }
            conn.commit().expect("commit");
        }

        let store = QuadStore::open(small(dir.path()).with_triple_indexes("opsc,spoc"))
            .expect("reopen with new indexes");
        let manager = &store.shared.manager;
        let committed = manager.committed().expect("committed");
        assert_eq!(committed.roots.len(), 2);
        let ctx = manager.indexes().context();
        for &root in &committed.roots {
            let tree = BTree::new(&ctx.cache, &ctx.reclaimer, root).with_fanout(4);
            assert_eq!(tree.validate().expect("valid tree"), 25);
        }
        let superblock = ctx.cache.pager().superblock().expect("superblock");
        let names: Vec<[u8; 4]> = superblock.indexes.iter().map(|i| i.name).collect();
        assert_eq!(names, vec![*b"opsc", *b"spoc"]);

        let mut conn = store.connection().expect("connection");
        let by_object = conn
            .get_statements(None, None, Some(&iri("o")), false, &[])
            .expect("get")
            .collect_all()
            .expect("collect");
        assert_eq!(by_object.len(), 25);
    }

    #[test]
    fn test_short_dictionary_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = QuadStore::open(small(dir.path())).expect("open");
            let mut conn = store.connection().expect("connection");
            conn.begin(IsolationLevel::SnapshotRead).expect("begin");
            add(&mut conn, "a", "b", "c");
            conn.commit().expect("commit");
        }
        fs::write(dir.path().join("terms.idx"), b"").expect("truncate index");
        fs::write(dir.path().join("terms.dat"), b"").expect("truncate data");
        let err = QuadStore::open(small(dir.path())).err().expect("must fail");
        assert!(err.is_consistency_fault(), "{err}");
    }

    #[test]
    fn test_torn_dictionary_tail_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = QuadStore::open(small(dir.path())).expect("open");
            let mut conn = store.connection().expect("connection");
            conn.begin(IsolationLevel::SnapshotRead).expect("begin");
            add(&mut conn, "a", "b", "c");
            conn.commit().expect("commit");
        }
        let mut data = fs::read(dir.path().join("terms.dat")).expect("read");
        data.extend_from_slice(&[0, 0, 0, 9, 1, 2]);
        fs::write(dir.path().join("terms.dat"), data).expect("write");

        let store = QuadStore::open(small(dir.path())).expect("reopen");
        let mut conn = store.connection().expect("connection");
        assert!(has_statement(&mut conn, Some(&iri("a")), None, None, false, &[]).expect("has"));
        assert_eq!(
            store.stats().expect("stats").dictionary.terms,
            3,
            "torn record dropped"
        );
    }

    #[test]
    fn test_namespaces_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = QuadStore::open(small(dir.path())).expect("open");
            let mut conn = store.connection().expect("connection");
            assert!(matches!(
                conn.set_namespace("ex", "http://example.org/"),
                Err(StoreError::NoActiveTransaction)
            ));
            conn.begin(IsolationLevel::SnapshotRead).expect("begin");
            conn.set_namespace("ex", "http://example.org/").expect("set");
            conn.set_namespace("rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#")
                .expect("set");
            assert_eq!(
                conn.get_namespace("ex").expect("get"),
                Some("http://example.org/".to_string())
            );
            conn.commit().expect("commit");
        }
        let store = QuadStore::open(small(dir.path())).expect("reopen");
        let mut conn = store.connection().expect("connection");
        assert_eq!(conn.namespaces().expect("namespaces").len(), 2);
        conn.begin(IsolationLevel::SnapshotRead).expect("begin");
        conn.remove_namespace("ex").expect("remove");
        conn.rollback().expect("rollback");
        assert!(conn.get_namespace("ex").expect("get").is_some());
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl StoreListener for Recorder {
        fn statement_added(&self, statement: &Statement) {
            self.events.lock().expect("lock").push(format!("+{}", statement.object));
        }

        fn statement_removed(&self, statement: &Statement) {
            self.events.lock().expect("lock").push(format!("-{}", statement.object));
        }

        fn transaction_committed(&self, _txn: u64) {
            self.events.lock().expect("lock").push("commit".to_string());
        }

        fn transaction_rolled_back(&self, _txn: u64) {
            self.events.lock().expect("lock").push("rollback".to_string());
        }
    }

    #[test]
    fn test_listeners_see_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open(small(dir.path())).expect("open");
        let recorder = Arc::new(Recorder::default());
        store.add_listener(Arc::clone(&recorder) as Arc<dyn StoreListener>);

        let mut conn = store.connection().expect("connection");
        conn.begin(IsolationLevel::SnapshotRead).expect("begin");
        conn.add_statement(&iri("s"), &iri("p"), &Term::literal("x"), &[])
            .expect("add");
        conn.add_statement(&iri("s"), &iri("p"), &Term::literal("x"), &[])
            .expect("duplicate add");
        conn.commit().expect("commit");
        conn.begin(IsolationLevel::SnapshotRead).expect("begin");
        conn.remove_statements(Some(&iri("s")), None, None, &[])
            .expect("remove");
        conn.rollback().expect("rollback");

        assert_eq!(
            *recorder.events.lock().expect("lock"),
            vec!["+\"x\"", "commit", "-\"x\"", "rollback"]
        );
    }

    #[test]
    fn test_clear_reports_per_context_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open(small(dir.path())).expect("open");
        let mut conn = store.connection().expect("connection");
        conn.begin(IsolationLevel::Snapshot).expect("begin");
        add(&mut conn, "a", "p", "b");
        for i in 0..3 {
            conn.add_statement(&iri("a"), &iri("p"), &iri(&format!("g{i}")), &[Some(iri("g1"))])
                .expect("add");
        }
        conn.add_statement(&iri("a"), &iri("p"), &iri("b"), &[Some(iri("g2"))])
            .expect("add");
        conn.add_inferred_statement(&iri("a"), &iri("q"), &iri("b"), &[Some(iri("g2"))])
            .expect("add inferred");
        conn.commit().expect("commit");

        let mut contexts = conn
            .context_ids()
            .expect("contexts")
            .collect_all()
            .expect("collect");
        contexts.sort_by_key(ToString::to_string);
        assert_eq!(contexts, vec![iri("g1"), iri("g2")]);

        conn.begin(IsolationLevel::Snapshot).expect("begin");
        let counts = conn.clear(&[]).expect("clear");
        assert_eq!(
            counts,
            vec![(None, 1), (Some(iri("g1")), 3), (Some(iri("g2")), 1)]
        );
        conn.commit().expect("commit");
        assert_eq!(conn.size(&[]).expect("size"), 0);
        // The inferred statement survives clearing explicit ones.
        let inferred = conn
            .get_statements(None, None, None, true, &[])
            .expect("get")
            .collect_all()
            .expect("collect");
        assert_eq!(inferred.len(), 1);
        assert!(!inferred[0].explicit);

        conn.begin(IsolationLevel::None).expect("begin");
        assert_eq!(conn.clear_inferred(&[]).expect("clear inferred"), 1);
        conn.commit().expect("commit");
        assert_eq!(store.stats().expect("stats").quads, 0);
    }

    #[test]
    fn test_unknown_terms_match_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open(small(dir.path())).expect("open");
        let mut conn = store.connection().expect("connection");
        conn.begin(IsolationLevel::SnapshotRead).expect("begin");
        add(&mut conn, "a", "p", "b");
        conn.commit().expect("commit");

        let terms_before = store.stats().expect("stats").dictionary.terms;
        assert!(!has_statement(&mut conn, Some(&iri("zzz")), None, None, true, &[]).expect("has"));
        assert_eq!(conn.size(&[Some(iri("nowhere"))]).expect("size"), 0);
        assert_eq!(conn.size(&[None]).expect("size"), 1);
        assert_eq!(store.stats().expect("stats").dictionary.terms, terms_before);
    }

    #[test]
    fn test_writes_need_a_transaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open(small(dir.path())).expect("open");
        let mut conn = store.connection().expect("connection");
        assert!(matches!(
            conn.add_statement(&iri("a"), &iri("b"), &iri("c"), &[]),
            Err(StoreError::NoActiveTransaction)
        ));
        conn.begin(IsolationLevel::Snapshot).expect("begin");
        assert!(matches!(
            conn.begin(IsolationLevel::Snapshot),
            Err(StoreError::TransactionActive)
        ));
        conn.rollback().expect("rollback");
        assert!(matches!(conn.commit(), Err(StoreError::NoActiveTransaction)));
    }

    #[test]
    fn test_uncommitted_direct_writes_invisible_to_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open(small(dir.path())).expect("open");
        let mut writer = store.connection().expect("writer");
        let mut reader = store.connection().expect("reader");

        writer.begin(IsolationLevel::ReadUncommitted).expect("begin");
        add(&mut writer, "a", "p", "b");
        assert_eq!(writer.size(&[]).expect("own view"), 1);

        reader.begin(IsolationLevel::Snapshot).expect("begin");
        assert_eq!(reader.size(&[]).expect("snapshot"), 0);
        let mut second = store.connection().expect("second writer");
        assert!(matches!(
            second.begin(IsolationLevel::ReadUncommitted),
            Err(StoreError::IsolationConflict(_))
        ));

        writer.commit().expect("commit");
        assert_eq!(reader.size(&[]).expect("snapshot"), 0);
        reader.commit().expect("read-only commit");
        assert_eq!(reader.size(&[]).expect("latest"), 1);
    }

    #[test]
    fn test_iteration_time_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open(small(dir.path())).expect("open");
        let mut conn = store.connection().expect("connection");
        conn.begin(IsolationLevel::None).expect("begin");
        for i in 0..10 {
            add(&mut conn, &format!("s{i}"), "p", "o");
        }
        conn.commit().expect("commit");

        conn.set_query_timeout(Some(Duration::ZERO));
        let mut results = conn
            .get_statements(None, None, None, false, &[])
            .expect("get");
        assert!(matches!(results.next(), Some(Err(StoreError::Iteration(_)))));
        assert!(results.next().is_none());

        conn.set_query_timeout(None);
        assert_eq!(conn.size(&[]).expect("size"), 10);
    }

    #[test]
    fn test_closed_store_refuses_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QuadStore::open(small(dir.path())).expect("open");
        let mut conn = store.connection().expect("connection");
        store.close().expect("close");
        assert!(matches!(store.connection(), Err(StoreError::Closed)));
        assert!(matches!(
            conn.begin(IsolationLevel::Snapshot),
            Err(StoreError::Closed)
        ));
    }
}
