// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
// Layers, bottom up:
// 1. Page store: fixed-size pages, a checksummed superblock, freed-page reuse
// 2. Node cache and copy-on-write B-trees keyed by 32-byte quads
// 3. Term dictionary: term <-> id, append-only data file
// 4. Quad index set: one tree per configured permutation
// 5. Transactions: isolation levels, writer slot, overlays, commit log
// 6. Store and connections: contexts, namespaces, listeners

pub mod config;
pub mod connection;
pub mod dictionary;
pub mod error;
pub mod index;
pub mod iteration;
pub mod namespaces;
pub mod observer;
pub mod simulation;
pub mod storage;
pub mod store;
pub mod txn;
pub mod types;

pub use config::{ConfigError, StoreConfig};
pub use connection::{Connection, QuadConnection, has_statement, in_transaction};
pub use error::StoreError;
pub use iteration::{CloseableIteration, Iteration, IterationError};
pub use observer::StoreListener;
pub use store::{QuadStore, StoreStats};
pub use txn::IsolationLevel;
pub use types::{Quad, Statement, Term, TermId};
