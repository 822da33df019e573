//! Store-level error type.
//!
//! Every layer keeps its own error enum; [`StoreError`] wraps them for the
//! connection API and adds the transaction outcomes.

use crate::config::ConfigError;
use crate::dictionary::DictionaryError;
use crate::iteration::IterationError;
use crate::namespaces::NamespaceError;
use crate::storage::btree::BTreeError;
use crate::storage::{CacheError, StorageError};

/// Errors returned by stores and connections.
#[derive(Debug)]
pub enum StoreError {
    /// Page store failure.
    Storage(StorageError),
    /// Index tree failure.
    BTree(BTreeError),
    /// Term dictionary failure.
    Dictionary(DictionaryError),
    /// Namespace file failure.
    Namespace(NamespaceError),
    /// A result iteration failed (e.g. timed out).
    Iteration(IterationError),
    /// Invalid configuration.
    Config(ConfigError),
    /// The isolation level cannot be granted right now.
    IsolationConflict(String),
    /// A serializable transaction overlaps a concurrent commit.
    SerializationConflict(String),
    /// A write was attempted outside a transaction.
    NoActiveTransaction,
    /// `begin` was called while a transaction is active.
    TransactionActive,
    /// The connection or store has been closed.
    Closed,
    /// Internal lock poisoned.
    LockPoisoned,
    /// Persistent state is inconsistent.
    Corruption(String),
}

impl StoreError {
    /// True for errors a caller can resolve by retrying the transaction.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::IsolationConflict(_) | Self::SerializationConflict(_)
        )
    }

    /// True when persistent state failed a consistency check.
    #[must_use]
    pub const fn is_consistency_fault(&self) -> bool {
        match self {
            Self::Corruption(_)
            | Self::Storage(StorageError::Corruption(_) | StorageError::Poisoned)
            | Self::BTree(
                BTreeError::Corrupt(_)
                | BTreeError::Node(_)
                | BTreeError::Storage(StorageError::Corruption(_) | StorageError::Poisoned),
            )
            | Self::Dictionary(DictionaryError::Corruption(_) | DictionaryError::NotFound(_))
            | Self::Namespace(NamespaceError::Corruption(_)) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::BTree(e) => write!(f, "index error: {e}"),
            Self::Dictionary(e) => write!(f, "{e}"),
            Self::Namespace(e) => write!(f, "{e}"),
            Self::Iteration(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::IsolationConflict(msg) => write!(f, "isolation conflict: {msg}"),
            Self::SerializationConflict(msg) => write!(f, "serialization conflict: {msg}"),
            Self::NoActiveTransaction => write!(f, "no active transaction"),
            Self::TransactionActive => write!(f, "a transaction is already active"),
            Self::Closed => write!(f, "store is closed"),
            Self::LockPoisoned => write!(f, "store lock poisoned"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::BTree(e) => Some(e),
            Self::Dictionary(e) => Some(e),
            Self::Namespace(e) => Some(e),
            Self::Iteration(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<BTreeError> for StoreError {
    fn from(e: BTreeError) -> Self {
        Self::BTree(e)
    }
}

impl From<CacheError> for StoreError {
    fn from(e: CacheError) -> Self {
        Self::BTree(e.into())
    }
}

impl From<DictionaryError> for StoreError {
    fn from(e: DictionaryError) -> Self {
        Self::Dictionary(e)
    }
}

impl From<NamespaceError> for StoreError {
    fn from(e: NamespaceError) -> Self {
        Self::Namespace(e)
    }
}

impl From<IterationError> for StoreError {
    fn from(e: IterationError) -> Self {
        Self::Iteration(e)
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TermId;

    #[test]
    fn test_classifiers() {
        assert!(StoreError::IsolationConflict("busy".into()).is_conflict());
        assert!(StoreError::SerializationConflict("overlap".into()).is_conflict());
        assert!(!StoreError::NoActiveTransaction.is_conflict());

        assert!(StoreError::Dictionary(DictionaryError::NotFound(TermId(7))).is_consistency_fault());
        assert!(StoreError::Storage(StorageError::Poisoned).is_consistency_fault());
        assert!(
            StoreError::BTree(BTreeError::Corrupt("bad order".into())).is_consistency_fault()
        );
        assert!(!StoreError::Storage(StorageError::InjectedFault("sync".into()))
            .is_consistency_fault());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StoreError::NoActiveTransaction.to_string(),
            "no active transaction"
        );
        assert_eq!(
            StoreError::from(IterationError::Timeout {
                limit: std::time::Duration::from_secs(1)
            })
            .to_string(),
            "iteration exceeded its time limit of 1s"
        );
    }
}
