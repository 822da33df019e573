//! Term identifiers.

use std::fmt;

/// A stable identifier of one term within a store.
///
/// # Invariants
///
/// - Assigned once by the dictionary and never reassigned to another term.
/// - `TermId(0)` is never assigned; it stands for the default graph in the
///   context position of a quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TermId(pub u64);

impl TermId {
    /// Context id of the default graph.
    pub const DEFAULT_GRAPH: Self = Self(0);

    /// First id the dictionary assigns.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_default_graph(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TermId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<TermId> for u64 {
    fn from(id: TermId) -> Self {
        id.0
    }
}
