//! Connections: statement CRUD and transaction control.
//!
//! # Contexts
//!
//! Every operation takes a context list. An empty list means every context;
//! `None` in a list means the default graph. Additions with an empty list go
//! to the default graph.
//!
//! # Invariants
//!
//! - Writes outside a transaction fail with
//!   [`StoreError::NoActiveTransaction`]; reads outside one see the latest
//!   committed state.
//! - A pattern naming a term the dictionary has never seen matches nothing,
//!   and looking it up assigns no id.
//! - `size` counts explicit statements only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::dictionary::TermDictionary;
use crate::error::StoreError;
use crate::index::is_explicit;
use crate::iteration::Iteration;
use crate::storage::btree::{FLAG_EXPLICIT, FLAG_INFERRED};
use crate::store::StoreShared;
use crate::txn::{IsolationLevel, Transaction};
use crate::types::{Quad, QuadPattern, Statement, Term, TermId};

/// Statement CRUD plus transaction control.
pub trait QuadConnection {
    /// Start a transaction. Fails if one is already active.
    fn begin(&mut self, level: IsolationLevel) -> Result<(), StoreError>;

    /// Make the active transaction durable and visible.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard the active transaction. Succeeds when none is active.
    fn rollback(&mut self) -> Result<(), StoreError>;

    fn is_active(&self) -> bool;

    /// Level of the active transaction.
    fn isolation_level(&self) -> Option<IsolationLevel>;

    /// Add an explicit statement to each context. Returns whether anything
    /// changed.
    fn add_statement(
        &mut self,
        subject: &Term,
        predicate: &Term,
        object: &Term,
        contexts: &[Option<Term>],
    ) -> Result<bool, StoreError>;

    /// Add an inferred statement; an explicit one with the same terms wins.
    fn add_inferred_statement(
        &mut self,
        subject: &Term,
        predicate: &Term,
        object: &Term,
        contexts: &[Option<Term>],
    ) -> Result<bool, StoreError>;

    /// Remove matching explicit statements. Returns how many were removed.
    fn remove_statements(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<u64, StoreError>;

    /// Remove matching inferred statements.
    fn remove_inferred_statements(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<u64, StoreError>;

    /// Lazily list matching statements.
    fn get_statements(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        include_inferred: bool,
        contexts: &[Option<Term>],
    ) -> Result<Iteration<Statement, StoreError>, StoreError>;

    /// Number of explicit statements in the given contexts.
    fn size(&mut self, contexts: &[Option<Term>]) -> Result<u64, StoreError>;

    /// Remove every explicit statement of the given contexts. Returns the
    /// number removed per context; `None` is the default graph.
    fn clear(&mut self, contexts: &[Option<Term>])
    -> Result<Vec<(Option<Term>, u64)>, StoreError>;

    /// Remove every inferred statement of the given contexts.
    fn clear_inferred(&mut self, contexts: &[Option<Term>]) -> Result<u64, StoreError>;

    /// Named contexts holding at least one statement.
    fn context_ids(&mut self) -> Result<Iteration<Term, StoreError>, StoreError>;

    fn set_namespace(&mut self, prefix: &str, name: &str) -> Result<(), StoreError>;

    fn get_namespace(&self, prefix: &str) -> Result<Option<String>, StoreError>;

    fn remove_namespace(&mut self, prefix: &str) -> Result<(), StoreError>;

    /// Every prefix mapping, ordered by prefix.
    fn namespaces(&self) -> Result<BTreeMap<String, String>, StoreError>;

    fn clear_namespaces(&mut self) -> Result<(), StoreError>;

    /// Roll back any active transaction and refuse further work.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// True if at least one statement matches.
pub fn has_statement(
    conn: &mut impl QuadConnection,
    subject: Option<&Term>,
    predicate: Option<&Term>,
    object: Option<&Term>,
    include_inferred: bool,
    contexts: &[Option<Term>],
) -> Result<bool, StoreError> {
    let mut statements =
        conn.get_statements(subject, predicate, object, include_inferred, contexts)?;
    match statements.next() {
        Some(Ok(_)) => Ok(true),
        Some(Err(e)) => Err(e),
        None => Ok(false),
    }
}

/// Run `work` in a transaction at `level`: commit if it succeeds, roll back
/// if it fails.
pub fn in_transaction<C, R>(
    conn: &mut C,
    level: IsolationLevel,
    work: impl FnOnce(&mut C) -> Result<R, StoreError>,
) -> Result<R, StoreError>
where
    C: QuadConnection,
{
    conn.begin(level)?;
    match work(conn) {
        Ok(result) => {
            conn.commit()?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback) = conn.rollback() {
                tracing::warn!("rollback after failed transaction body failed: {rollback}");
            }
            Err(e)
        }
    }
}

/// A connection to a [`QuadStore`](crate::store::QuadStore).
pub struct Connection {
    shared: Arc<StoreShared>,
    txn: Option<Transaction>,
    query_timeout: Option<Duration>,
    closed: bool,
}

impl Connection {
    pub(crate) const fn new(shared: Arc<StoreShared>) -> Self {
        Self {
            shared,
            txn: None,
            query_timeout: None,
            closed: false,
        }
    }

    /// Limit how long each `get_statements` iteration may run.
    pub const fn set_query_timeout(&mut self, timeout: Option<Duration>) {
        self.query_timeout = timeout;
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        self.shared.check_open()
    }

    fn dictionary(&self) -> &Arc<TermDictionary> {
        self.shared.manager.dictionary()
    }

    /// Id of a bound pattern term. `Ok(None)` means the term is unknown.
    fn lookup(&self, term: Option<&Term>) -> Result<Option<Option<TermId>>, StoreError> {
        match term {
            None => Ok(Some(None)),
            Some(term) => Ok(self.dictionary().lookup_id(term)?.map(Some)),
        }
    }

    /// One pattern per requested context. Empty when nothing can match.
    fn patterns(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<Vec<QuadPattern>, StoreError> {
        let (Some(subject), Some(predicate), Some(object)) = (
            self.lookup(subject)?,
            self.lookup(predicate)?,
            self.lookup(object)?,
        ) else {
            return Ok(Vec::new());
        };
        let base = QuadPattern {
            subject,
            predicate,
            object,
            context: None,
        };
        if contexts.is_empty() {
            return Ok(vec![base]);
        }

        let mut patterns = Vec::with_capacity(contexts.len());
        for context in contexts {
            let id = match context {
                None => TermId::DEFAULT_GRAPH,
                Some(term) => match self.dictionary().lookup_id(term)? {
                    Some(id) => id,
                    None => continue,
                },
            };
            let pattern = QuadPattern {
                context: Some(id),
                ..base
            };
            if !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }
        Ok(patterns)
    }

    fn add(
        &mut self,
        subject: &Term,
        predicate: &Term,
        object: &Term,
        contexts: &[Option<Term>],
        explicit: bool,
    ) -> Result<bool, StoreError> {
        self.check_open()?;
        if self.txn.is_none() {
            return Err(StoreError::NoActiveTransaction);
        }
        let dictionary = Arc::clone(self.dictionary());
        let s = dictionary.get_or_create_id(subject)?;
        let p = dictionary.get_or_create_id(predicate)?;
        let o = dictionary.get_or_create_id(object)?;
        let mut context_ids = Vec::with_capacity(contexts.len().max(1));
        for context in contexts {
            let id = match context {
                Some(term) => dictionary.get_or_create_id(term)?,
                None => TermId::DEFAULT_GRAPH,
            };
            if !context_ids.contains(&id) {
                context_ids.push(id);
            }
        }
        if context_ids.is_empty() {
            context_ids.push(TermId::DEFAULT_GRAPH);
        }

        let notify = !self.shared.listeners.is_empty();
        let mut changed = false;
        for context in context_ids {
            let quad = Quad::new(s, p, o, context);
            let txn = self.txn.as_mut().ok_or(StoreError::NoActiveTransaction)?;
            if !self.shared.manager.insert(txn, quad, explicit)? {
                continue;
            }
            changed = true;
            if notify {
                let statement = Statement {
                    subject: subject.clone(),
                    predicate: predicate.clone(),
                    object: object.clone(),
                    context: (!context.is_default_graph())
                        .then(|| dictionary.resolve(context))
                        .transpose()?,
                    explicit,
                };
                self.shared
                    .listeners
                    .notify(|listener| listener.statement_added(&statement));
            }
        }
        Ok(changed)
    }

    fn remove(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &[Option<Term>],
        explicit: bool,
    ) -> Result<u64, StoreError> {
        self.check_open()?;
        if self.txn.is_none() {
            return Err(StoreError::NoActiveTransaction);
        }
        let patterns = self.patterns(subject, predicate, object, contexts)?;
        let mut removed = 0;
        for pattern in patterns {
            removed += self.remove_matching(pattern, explicit)?;
        }
        Ok(removed)
    }

    fn remove_matching(&mut self, pattern: QuadPattern, explicit: bool) -> Result<u64, StoreError> {
        let shared = Arc::clone(&self.shared);
        let notify = !shared.listeners.is_empty();
        let dictionary = shared.manager.dictionary();
        let txn = self.txn.as_mut().ok_or(StoreError::NoActiveTransaction)?;
        let flags = if explicit { FLAG_EXPLICIT } else { FLAG_INFERRED };
        shared.manager.remove_matching(
            txn,
            pattern,
            explicit,
            shared.config.iteration_cache_sync_threshold,
            |quad| {
                if notify {
                    let statement = to_statement(dictionary, quad, flags)?;
                    shared
                        .listeners
                        .notify(|listener| listener.statement_removed(&statement));
                }
                Ok(())
            },
        )
    }

    fn end(&mut self, commit: bool) -> Result<(), StoreError> {
        let Some(txn) = self.txn.take() else {
            return if commit {
                Err(StoreError::NoActiveTransaction)
            } else {
                Ok(())
            };
        };
        let id = txn.id();
        let manager = &self.shared.manager;
        let result = if commit {
            manager.commit(txn)
        } else {
            manager.rollback(txn)
        };
        let listeners = &self.shared.listeners;
        match &result {
            Ok(()) if commit => listeners.notify(|l| l.transaction_committed(id)),
            _ => listeners.notify(|l| l.transaction_rolled_back(id)),
        }
        result
    }
}

fn to_statement(
    dictionary: &TermDictionary,
    quad: &Quad,
    flags: u8,
) -> Result<Statement, StoreError> {
    Ok(Statement {
        subject: dictionary.resolve(quad.subject)?,
        predicate: dictionary.resolve(quad.predicate)?,
        object: dictionary.resolve(quad.object)?,
        context: if quad.context.is_default_graph() {
            None
        } else {
            Some(dictionary.resolve(quad.context)?)
        },
        explicit: is_explicit(flags),
    })
}

impl QuadConnection for Connection {
    fn begin(&mut self, level: IsolationLevel) -> Result<(), StoreError> {
        self.check_open()?;
        if self.txn.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.txn = Some(self.shared.manager.begin(level)?);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        self.end(true)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.end(false)
    }

    fn is_active(&self) -> bool {
        self.txn.is_some()
    }

    fn isolation_level(&self) -> Option<IsolationLevel> {
        self.txn.as_ref().map(Transaction::level)
    }

    fn add_statement(
        &mut self,
        subject: &Term,
        predicate: &Term,
        object: &Term,
        contexts: &[Option<Term>],
    ) -> Result<bool, StoreError> {
        self.add(subject, predicate, object, contexts, true)
    }

    fn add_inferred_statement(
        &mut self,
        subject: &Term,
        predicate: &Term,
        object: &Term,
        contexts: &[Option<Term>],
    ) -> Result<bool, StoreError> {
        self.add(subject, predicate, object, contexts, false)
    }

    fn remove_statements(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<u64, StoreError> {
        self.remove(subject, predicate, object, contexts, true)
    }

    fn remove_inferred_statements(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<u64, StoreError> {
        self.remove(subject, predicate, object, contexts, false)
    }

    fn get_statements(
        &mut self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        include_inferred: bool,
        contexts: &[Option<Term>],
    ) -> Result<Iteration<Statement, StoreError>, StoreError> {
        self.check_open()?;
        let patterns = self.patterns(subject, predicate, object, contexts)?;
        let mut parts = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            parts.push(self.shared.manager.scan(self.txn.as_mut(), pattern)?);
        }
        let mut parts = parts.into_iter();
        let Some(first) = parts.next() else {
            return Ok(Iteration::empty());
        };
        let matches = first.union(parts.collect());

        let dictionary = Arc::clone(self.dictionary());
        let statements = matches.filter_map(move |(quad, flags)| {
            if !include_inferred && !is_explicit(flags) {
                return Ok(None);
            }
            to_statement(&dictionary, &quad, flags).map(Some)
        });
        Ok(match self.query_timeout {
            Some(limit) => statements.with_time_limit(limit),
            None => statements,
        })
    }

    fn size(&mut self, contexts: &[Option<Term>]) -> Result<u64, StoreError> {
        self.check_open()?;
        let patterns = self.patterns(None, None, None, contexts)?;
        let mut count = 0;
        for pattern in patterns {
            for item in self.shared.manager.scan(self.txn.as_mut(), pattern)? {
                let (_, flags) = item?;
                if is_explicit(flags) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn clear(
        &mut self,
        contexts: &[Option<Term>],
    ) -> Result<Vec<(Option<Term>, u64)>, StoreError> {
        self.check_open()?;
        if self.txn.is_none() {
            return Err(StoreError::NoActiveTransaction);
        }
        let targets: Vec<Option<Term>> = if contexts.is_empty() {
            let mut all = vec![None];
            all.extend(self.context_ids()?.collect_all()?.into_iter().map(Some));
            all
        } else {
            contexts.to_vec()
        };

        let mut counts = Vec::with_capacity(targets.len());
        for context in targets {
            let removed = self.remove(None, None, None, std::slice::from_ref(&context), true)?;
            counts.push((context, removed));
        }
        Ok(counts)
    }

    fn clear_inferred(&mut self, contexts: &[Option<Term>]) -> Result<u64, StoreError> {
        self.remove(None, None, None, contexts, false)
    }

    fn context_ids(&mut self) -> Result<Iteration<Term, StoreError>, StoreError> {
        self.check_open()?;
        let mut ids = BTreeSet::new();
        for item in self
            .shared
            .manager
            .scan(self.txn.as_mut(), QuadPattern::default())?
        {
            let (quad, _) = item?;
            if !quad.context.is_default_graph() {
                ids.insert(quad.context);
            }
        }
        let dictionary = self.dictionary();
        let terms = ids
            .into_iter()
            .map(|id| dictionary.resolve(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Iteration::from_vec(terms))
    }

    fn set_namespace(&mut self, prefix: &str, name: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let txn = self.txn.as_mut().ok_or(StoreError::NoActiveTransaction)?;
        txn.namespaces_mut().set(prefix, name);
        Ok(())
    }

    fn get_namespace(&self, prefix: &str) -> Result<Option<String>, StoreError> {
        self.check_open()?;
        let committed = self.shared.manager.namespaces();
        Ok(match &self.txn {
            Some(txn) => txn.namespaces().get(committed, prefix)?,
            None => committed.get(prefix)?,
        })
    }

    fn remove_namespace(&mut self, prefix: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let txn = self.txn.as_mut().ok_or(StoreError::NoActiveTransaction)?;
        txn.namespaces_mut().remove(prefix);
        Ok(())
    }

    fn namespaces(&self) -> Result<BTreeMap<String, String>, StoreError> {
        self.check_open()?;
        let committed = self.shared.manager.namespaces().all()?;
        Ok(match &self.txn {
            Some(txn) => txn.namespaces().merged(&committed),
            None => committed,
        })
    }

    fn clear_namespaces(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        let txn = self.txn.as_mut().ok_or(StoreError::NoActiveTransaction)?;
        txn.namespaces_mut().clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        let result = self.rollback();
        self.closed = true;
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("rolling back on connection drop failed: {e}");
        }
    }
}
