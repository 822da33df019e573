//! Seeded random workloads against a store on simulated storage.
//!
//! Each round runs one transaction at a random isolation level with a few
//! random additions and removals, then compares the store with an in-memory
//! model of the committed statements. Faults are injected while the
//! transaction runs and switched off for the comparison.
//!
//! A commit that fails leaves the durable state unknown: the new generation
//! may or may not have reached the disk. The workload then crashes the device,
//! reopens the store and accepts either the old or the new state.

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::storage::{FaultConfig, SimulatedDiskHandle, SimulatedStorage};
use crate::config::StoreConfig;
use crate::connection::{Connection, QuadConnection};
use crate::error::StoreError;
use crate::store::QuadStore;
use crate::txn::IsolationLevel;
use crate::types::{Statement, Term};

/// Subject, predicate, object and context of a statement.
type Key = (Term, Term, Term, Option<Term>);

/// Statement keys mapped to whether they are explicit.
type Model = HashMap<Key, bool>;

/// Configuration for a workload run.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Number of transactions to run.
    pub transactions: usize,
    /// Upper bound on operations per transaction.
    pub max_operations: usize,
    /// Number of distinct subjects; fewer means more overlap.
    pub subjects: u32,
    /// Probability of a simulated power loss after a transaction.
    pub crash_rate: f64,
    /// Faults injected while transactions run.
    pub fault_config: FaultConfig,
}

impl WorkloadConfig {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            transactions: 100,
            max_operations: 8,
            subjects: 16,
            crash_rate: 0.0,
            fault_config: FaultConfig::no_faults(),
        }
    }

    #[must_use]
    pub const fn with_transactions(mut self, transactions: usize) -> Self {
        self.transactions = transactions;
        self
    }

    #[must_use]
    pub const fn with_crash_rate(mut self, rate: f64) -> Self {
        self.crash_rate = rate;
        self
    }

    #[must_use]
    pub fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }
}

/// A mismatch between the store and the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub description: String,
    /// Index of the transaction after which it was found.
    pub operation_index: usize,
}

/// Results from a workload run.
#[derive(Debug, Default)]
pub struct WorkloadResult {
    pub seed: u64,
    pub committed: u64,
    /// Transactions that failed before commit and were rolled back.
    pub rolled_back: u64,
    /// Commits that returned an error.
    pub failed_commits: u64,
    /// Failed commits whose changes turned out durable after recovery.
    pub recovered_commits: u64,
    pub crashes: u64,
    pub invariant_violations: Vec<InvariantViolation>,
}

impl WorkloadResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.invariant_violations.is_empty()
    }
}

enum Operation {
    Add { key: Key, explicit: bool },
    Remove { subject: Term, explicit: bool },
}

/// Outcome of one transaction.
enum Round {
    Committed,
    RolledBack,
    CommitFailed(StoreError),
}

/// A seeded workload runner.
pub struct Workload {
    config: WorkloadConfig,
    rng: StdRng,
    expected: Model,
    result: WorkloadResult,
}

impl Workload {
    #[must_use]
    pub fn new(config: WorkloadConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let result = WorkloadResult {
            seed: config.seed,
            ..WorkloadResult::default()
        };
        Self {
            config,
            rng,
            expected: Model::new(),
            result,
        }
    }

    /// Run the workload on a store whose dictionary lives in
    /// `store_config.data_dir`.
    ///
    /// Errors are setup failures; mismatches are reported in the result.
    pub fn run(mut self, store_config: &StoreConfig) -> Result<WorkloadResult, StoreError> {
        let storage = SimulatedStorage::new(self.config.seed);
        let mut handle = storage.handle();
        let mut store = QuadStore::open_with_storage(store_config.clone(), Box::new(storage))?;

        for index in 0..self.config.transactions {
            let operations = self.operations();
            handle.set_fault_config(self.config.fault_config.clone());
            let round = self.round(&store, &operations);
            handle.set_fault_config(FaultConfig::no_faults());

            let mut proposed = self.expected.clone();
            for operation in &operations {
                apply(&mut proposed, operation);
            }

            match round {
                Round::Committed => {
                    self.result.committed += 1;
                    self.expected = proposed;
                }
                Round::RolledBack => self.result.rolled_back += 1,
                Round::CommitFailed(e) => {
                    tracing::debug!(index, "commit failed: {e}");
                    self.result.failed_commits += 1;
                    (store, handle) = self.crash(store, &handle, store_config)?;
                    let observed = observe(&store)?;
                    if observed == proposed {
                        self.result.recovered_commits += 1;
                        self.expected = proposed;
                    }
                }
            }

            if self.rng.random::<f64>() < self.config.crash_rate {
                (store, handle) = self.crash(store, &handle, store_config)?;
            }
            self.check(&store, index)?;
        }
        store.close()?;
        Ok(self.result)
    }

    fn operations(&mut self) -> Vec<Operation> {
        let count = self.rng.random_range(1..=self.config.max_operations.max(1));
        (0..count)
            .map(|_| {
                let explicit = self.rng.random::<f64>() < 0.75;
                if self.rng.random::<f64>() < 0.7 {
                    Operation::Add {
                        key: self.random_key(),
                        explicit,
                    }
                } else {
                    Operation::Remove {
                        subject: self.random_subject(),
                        explicit,
                    }
                }
            })
            .collect()
    }

    fn random_subject(&mut self) -> Term {
        let n = self.rng.random_range(0..self.config.subjects.max(1));
        Term::iri(format!("urn:s{n}"))
    }

    fn random_key(&mut self) -> Key {
        let subject = self.random_subject();
        let predicate = Term::iri(format!("urn:p{}", self.rng.random_range(0..3)));
        let value = self.rng.random_range(0..20);
        let object = match self.rng.random_range(0..3) {
            0 => Term::literal(format!("v{value}")),
            1 => Term::lang_literal(format!("v{value}"), "en"),
            _ => Term::iri(format!("urn:o{value}")),
        };
        let context = match self.rng.random_range(0..4) {
            0 | 1 => None,
            n => Some(Term::iri(format!("urn:g{n}"))),
        };
        (subject, predicate, object, context)
    }

    fn round(&mut self, store: &QuadStore, operations: &[Operation]) -> Round {
        let level = IsolationLevel::ALL[self.rng.random_range(0..IsolationLevel::ALL.len())];
        let mut conn = match store.connection() {
            Ok(conn) => conn,
            Err(_) => return Round::RolledBack,
        };
        let body = run_operations(&mut conn, level, operations);

        if body.is_err() {
            if let Err(e) = conn.rollback() {
                tracing::debug!("rollback failed: {e}");
            }
            return Round::RolledBack;
        }
        match conn.commit() {
            Ok(()) => Round::Committed,
            Err(e) => Round::CommitFailed(e),
        }
    }

    /// Drop `store`, keep only the durable image and reopen.
    fn crash(
        &mut self,
        store: QuadStore,
        handle: &SimulatedDiskHandle,
        store_config: &StoreConfig,
    ) -> Result<(QuadStore, SimulatedDiskHandle), StoreError> {
        self.result.crashes += 1;
        let recovered = handle.crash();
        drop(store);
        let handle = recovered.handle();
        let store = QuadStore::open_with_storage(store_config.clone(), Box::new(recovered))?;
        Ok((store, handle))
    }

    fn check(&mut self, store: &QuadStore, operation_index: usize) -> Result<(), StoreError> {
        let observed = observe(store)?;
        if observed != self.expected {
            let missing = self
                .expected
                .iter()
                .filter(|(key, explicit)| observed.get(*key) != Some(*explicit))
                .count();
            let extra = observed
                .iter()
                .filter(|(key, explicit)| self.expected.get(*key) != Some(*explicit))
                .count();
            self.result.invariant_violations.push(InvariantViolation {
                description: format!(
                    "store differs from model: {missing} missing, {extra} unexpected"
                ),
                operation_index,
            });
        }

        let explicit = self.expected.values().filter(|explicit| **explicit).count() as u64;
        let size = store.connection()?.size(&[])?;
        if size != explicit {
            self.result.invariant_violations.push(InvariantViolation {
                description: format!("size is {size}, model holds {explicit} explicit"),
                operation_index,
            });
        }

        let stats = store.stats()?;
        if stats.transactions.writer_held || stats.active_readers != 0 {
            self.result.invariant_violations.push(InvariantViolation {
                description: format!(
                    "idle store holds the writer slot or readers: {:?}",
                    stats.transactions
                ),
                operation_index,
            });
        }
        Ok(())
    }
}

fn run_operations(
    conn: &mut Connection,
    level: IsolationLevel,
    operations: &[Operation],
) -> Result<(), StoreError> {
    conn.begin(level)?;
    for operation in operations {
        match operation {
            Operation::Add {
                key: (s, p, o, c),
                explicit: true,
            } => {
                conn.add_statement(s, p, o, std::slice::from_ref(c))?;
            }
            Operation::Add {
                key: (s, p, o, c),
                explicit: false,
            } => {
                conn.add_inferred_statement(s, p, o, std::slice::from_ref(c))?;
            }
            Operation::Remove {
                subject,
                explicit: true,
            } => {
                conn.remove_statements(Some(subject), None, None, &[])?;
            }
            Operation::Remove {
                subject,
                explicit: false,
            } => {
                conn.remove_inferred_statements(Some(subject), None, None, &[])?;
            }
        }
    }
    Ok(())
}

/// An explicit add upgrades an inferred statement; an inferred add never
/// downgrades an explicit one.
fn apply(model: &mut Model, operation: &Operation) {
    match operation {
        Operation::Add { key, explicit } => {
            if *explicit || !model.contains_key(key) {
                model.insert(key.clone(), *explicit);
            }
        }
        Operation::Remove { subject, explicit } => {
            model.retain(|(s, ..), is_explicit| s != subject || is_explicit != explicit);
        }
    }
}

fn observe(store: &QuadStore) -> Result<Model, StoreError> {
    let statements = store
        .connection()?
        .get_statements(None, None, None, true, &[])?
        .collect_all()?;
    Ok(statements
        .into_iter()
        .map(|statement: Statement| {
            (
                (
                    statement.subject,
                    statement.predicate,
                    statement.object,
                    statement.context,
                ),
                statement.explicit,
            )
        })
        .collect())
}
