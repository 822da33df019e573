//! Private write overlay of a transaction.
//!
//! Each touched quad records the flags it had in the transaction's base
//! view when first touched and the flags the transaction wants it to have.
//!
//! When the base view is fixed for the whole transaction, an entry whose
//! wanted state equals its base is dropped, so adding an existing quad or
//! removing an absent one leaves no trace. Levels that read a fresh committed
//! state per operation keep every touched entry: the base may have moved
//! since the entry was created, and the wanted state is what commit writes.

use std::collections::{BTreeMap, BTreeSet};

use crate::index::is_explicit;
use crate::storage::btree::{FLAG_EXPLICIT, FLAG_INFERRED};
use crate::types::{Quad, QuadPattern};

/// Base flags at first touch and wanted flags of one quad. `None` means
/// absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayEntry {
    pub base: Option<u8>,
    pub current: Option<u8>,
}

/// Buffered writes and observed read patterns of one transaction.
#[derive(Debug, Default)]
pub struct Changeset {
    entries: BTreeMap<Quad, OverlayEntry>,
    /// Drop entries that match their base again.
    collapse: bool,
    /// Quads written straight to the working trees (direct levels).
    direct_writes: BTreeSet<Quad>,
    /// Patterns read, kept for serializable validation.
    observed: Vec<QuadPattern>,
}

impl Changeset {
    /// An empty changeset. `fixed_base` says whether every operation of the
    /// transaction reads the same base state.
    #[must_use]
    pub fn new(fixed_base: bool) -> Self {
        Self {
            collapse: fixed_base,
            ..Self::default()
        }
    }

    fn state(&self, quad: &Quad, base: Option<u8>) -> OverlayEntry {
        self.entries.get(quad).copied().unwrap_or(OverlayEntry {
            base,
            current: base,
        })
    }

    fn set(&mut self, quad: Quad, entry: OverlayEntry) {
        if self.collapse && entry.current == entry.base {
            self.entries.remove(&quad);
        } else {
            self.entries.insert(quad, entry);
        }
    }

    /// Buffer an add. `base` is the quad's flags in the base view.
    /// Returns whether the transaction's view changed.
    pub fn add(&mut self, quad: Quad, base: Option<u8>, explicit: bool) -> bool {
        let mut entry = self.state(&quad, base);
        let flag = if explicit { FLAG_EXPLICIT } else { FLAG_INFERRED };
        let wanted = Some(entry.current.map_or(flag, |f| f | flag));
        if wanted == entry.current {
            return false;
        }
        entry.current = wanted;
        self.set(quad, entry);
        true
    }

    /// Buffer a removal of the given kind. Returns whether it removed anything.
    pub fn remove(&mut self, quad: Quad, base: Option<u8>, explicit: bool) -> bool {
        let mut entry = self.state(&quad, base);
        match entry.current {
            Some(flags) if is_explicit(flags) == explicit => {
                entry.current = None;
                self.set(quad, entry);
                true
            }
            _ => false,
        }
    }

    /// Flags of `quad` as written by this transaction, if it touched it.
    #[must_use]
    pub fn lookup(&self, quad: &Quad) -> Option<Option<u8>> {
        self.entries.get(quad).map(|entry| entry.current)
    }

    /// Touched quads matching `pattern`.
    pub fn matching<'a>(
        &'a self,
        pattern: &'a QuadPattern,
    ) -> impl Iterator<Item = (&'a Quad, &'a OverlayEntry)> + 'a {
        self.entries
            .iter()
            .filter(move |(quad, _)| pattern.matches(quad))
    }

    /// Every buffered entry in quad order.
    pub fn entries(&self) -> impl Iterator<Item = (&Quad, &OverlayEntry)> {
        self.entries.iter()
    }

    pub fn record_direct(&mut self, quad: Quad) {
        self.direct_writes.insert(quad);
    }

    pub fn observe(&mut self, pattern: QuadPattern) {
        if !self.observed.contains(&pattern) {
            self.observed.push(pattern);
        }
    }

    /// Quads this transaction changes, buffered or direct.
    #[must_use]
    pub fn written(&self) -> Vec<Quad> {
        self.entries
            .keys()
            .chain(&self.direct_writes)
            .copied()
            .collect()
    }

    /// First quad of `others_wrote` this transaction read or wrote.
    #[must_use]
    pub fn conflict_with(&self, others_wrote: &[Quad]) -> Option<Quad> {
        others_wrote.iter().copied().find(|quad| {
            self.entries.contains_key(quad)
                || self.observed.iter().any(|pattern| pattern.matches(quad))
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.direct_writes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.direct_writes.clear();
        self.observed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TermId;

    fn quad(s: u64) -> Quad {
        Quad::from_ids([s, 2, 3, 0])
    }

    #[test]
    fn test_add_of_existing_quad_is_dropped() {
        let mut changes = Changeset::new(true);
        assert!(!changes.add(quad(1), Some(FLAG_EXPLICIT), true));
        assert!(changes.is_empty());

        assert!(changes.add(quad(2), None, true));
        assert!(!changes.add(quad(2), None, true));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.lookup(&quad(2)), Some(Some(FLAG_EXPLICIT)));
    }

    #[test]
    fn test_remove_then_add_restores_base() {
        let mut changes = Changeset::new(true);
        assert!(changes.remove(quad(1), Some(FLAG_EXPLICIT), true));
        assert_eq!(changes.lookup(&quad(1)), Some(None));
        assert!(changes.add(quad(1), Some(FLAG_EXPLICIT), true));
        assert!(changes.is_empty());
    }

    #[test]
    fn test_kinds() {
        let mut changes = Changeset::new(true);
        // An inferred removal leaves an explicit quad alone.
        assert!(!changes.remove(quad(1), Some(FLAG_EXPLICIT), false));
        // An explicit add upgrades an inferred quad.
        assert!(changes.add(quad(2), Some(FLAG_INFERRED), true));
        assert_eq!(changes.lookup(&quad(2)), Some(Some(FLAG_EXPLICIT)));
        // An inferred add never downgrades.
        assert!(!changes.add(quad(2), Some(FLAG_INFERRED), false));
    }

    #[test]
    fn test_moving_base_keeps_touched_entries() {
        let mut changes = Changeset::new(false);
        // Removed while committed, then re-added after another transaction
        // removed it: the add must survive though the latest base is absent.
        assert!(changes.remove(quad(1), Some(FLAG_EXPLICIT), true));
        assert!(changes.add(quad(1), None, true));
        assert_eq!(changes.lookup(&quad(1)), Some(Some(FLAG_EXPLICIT)));

        // Added while absent, then removed after another transaction added it.
        assert!(changes.add(quad(2), None, true));
        assert!(changes.remove(quad(2), Some(FLAG_EXPLICIT), true));
        assert_eq!(changes.lookup(&quad(2)), Some(None));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_conflicts() {
        let mut changes = Changeset::new(true);
        changes.add(quad(1), None, true);
        changes.observe(QuadPattern {
            subject: Some(TermId(5)),
            ..QuadPattern::default()
        });
        assert_eq!(changes.conflict_with(&[quad(9)]), None);
        assert_eq!(changes.conflict_with(&[quad(9), quad(1)]), Some(quad(1)));
        assert_eq!(changes.conflict_with(&[quad(5)]), Some(quad(5)));
    }
}
