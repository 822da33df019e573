//! Transactions and isolation.

mod changeset;
mod isolation;
mod manager;
mod writer;

pub use changeset::{Changeset, OverlayEntry};
pub use isolation::IsolationLevel;
pub use manager::{CommittedState, Snapshot, Transaction, TxnManager, TxnStats};
pub use writer::{WriterGuard, WriterSlot};
