//! Isolation levels.

use std::fmt;
use std::str::FromStr;

/// Transaction isolation levels, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsolationLevel {
    None,
    ReadUncommitted,
    ReadCommitted,
    SnapshotRead,
    Snapshot,
    Serializable,
}

impl IsolationLevel {
    /// Every level, weakest first.
    pub const ALL: [Self; 6] = [
        Self::None,
        Self::ReadUncommitted,
        Self::ReadCommitted,
        Self::SnapshotRead,
        Self::Snapshot,
        Self::Serializable,
    ];

    /// Writes go straight to the shared working trees, and the writer slot
    /// is held from the first write to `commit`.
    #[must_use]
    pub const fn is_direct(self) -> bool {
        matches!(self, Self::None | Self::ReadUncommitted)
    }

    /// Reads use one snapshot captured at `begin`.
    #[must_use]
    pub const fn has_fixed_snapshot(self) -> bool {
        matches!(self, Self::Snapshot | Self::Serializable)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::ReadUncommitted => "READ_UNCOMMITTED",
            Self::ReadCommitted => "READ_COMMITTED",
            Self::SnapshotRead => "SNAPSHOT_READ",
            Self::Snapshot => "SNAPSHOT",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        Self::SnapshotRead
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == normalized)
            .ok_or_else(|| format!("unknown isolation level '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(IsolationLevel::None < IsolationLevel::ReadUncommitted);
        assert!(IsolationLevel::ReadCommitted < IsolationLevel::SnapshotRead);
        assert!(IsolationLevel::Snapshot < IsolationLevel::Serializable);
        assert!(IsolationLevel::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "read-committed".parse::<IsolationLevel>(),
            Ok(IsolationLevel::ReadCommitted)
        );
        assert_eq!(
            "SERIALIZABLE".parse::<IsolationLevel>(),
            Ok(IsolationLevel::Serializable)
        );
        assert!("strict".parse::<IsolationLevel>().is_err());
        for level in IsolationLevel::ALL {
            assert_eq!(level.to_string().parse::<IsolationLevel>(), Ok(level));
        }
    }

    #[test]
    fn test_level_classes() {
        assert!(IsolationLevel::ReadUncommitted.is_direct());
        assert!(!IsolationLevel::ReadCommitted.is_direct());
        assert!(IsolationLevel::Serializable.has_fixed_snapshot());
        assert!(!IsolationLevel::SnapshotRead.has_fixed_snapshot());
    }
}
