//! The set of permutation B-trees that together index every quad.
//!
//! The set owns no roots. Callers pass the root list they are working on
//! (the writer's working roots or a committed snapshot), which lets one set
//! serve every transaction.

use std::sync::Arc;

use crate::index::permutation::{Permutation, best_index};
use crate::iteration::CloseableIteration;
use crate::storage::btree::{
    BTreeError, FLAG_EXPLICIT, FLAG_INFERRED, RangeScan, TreeContext, prefix_lower_bound,
    prefix_upper_bound,
};
use crate::storage::{IndexRoot, PageId, ReaderGuard};
use crate::types::{Quad, QuadPattern};

/// The configured permutations over one tree context.
pub struct QuadIndexSet {
    permutations: Vec<Permutation>,
    ctx: TreeContext,
}

impl QuadIndexSet {
    #[must_use]
    pub const fn new(permutations: Vec<Permutation>, ctx: TreeContext) -> Self {
        Self { permutations, ctx }
    }

    #[must_use]
    pub fn permutations(&self) -> &[Permutation] {
        &self.permutations
    }

    #[must_use]
    pub const fn context(&self) -> &TreeContext {
        &self.ctx
    }

    /// Superblock entries for `roots`.
    #[must_use]
    pub fn index_roots(&self, roots: &[PageId]) -> Vec<IndexRoot> {
        self.permutations
            .iter()
            .zip(roots)
            .map(|(permutation, &root)| IndexRoot {
                name: permutation.name(),
                root,
            })
            .collect()
    }

    /// Flags stored for `quad`, if present.
    pub fn get(&self, roots: &[PageId], quad: &Quad) -> Result<Option<u8>, BTreeError> {
        let (Some(permutation), Some(&root)) = (self.permutations.first(), roots.first()) else {
            return Ok(None);
        };
        self.ctx.tree(root).get(&permutation.key(quad))
    }

    /// Add `quad` to every index. Returns the flags it had before.
    ///
    /// An explicit add upgrades an inferred quad; an inferred add never
    /// downgrades an explicit one.
    pub fn insert(
        &self,
        roots: &mut [PageId],
        quad: &Quad,
        explicit: bool,
    ) -> Result<Option<u8>, BTreeError> {
        let flags = if explicit { FLAG_EXPLICIT } else { FLAG_INFERRED };
        let mut previous = None;
        for (permutation, root) in self.permutations.iter().zip(roots.iter_mut()) {
            let mut tree = self.ctx.tree(*root);
            previous = tree.insert(permutation.key(quad), flags)?;
            *root = tree.root();
        }
        Ok(previous)
    }

    /// Remove `quad` from every index if its explicit flag equals `explicit`.
    /// Returns whether it was removed.
    pub fn remove(
        &self,
        roots: &mut [PageId],
        quad: &Quad,
        explicit: bool,
    ) -> Result<bool, BTreeError> {
        match self.get(roots, quad)? {
            Some(flags) if is_explicit(flags) == explicit => {}
            _ => return Ok(false),
        }
        for (permutation, root) in self.permutations.iter().zip(roots.iter_mut()) {
            let mut tree = self.ctx.tree(*root);
            tree.delete(&permutation.key(quad))?;
            *root = tree.root();
        }
        Ok(true)
    }

    /// Lazily scan the best index for quads matching `pattern`.
    #[must_use]
    pub fn scan(
        &self,
        roots: &[PageId],
        pattern: QuadPattern,
        reader: Option<ReaderGuard>,
    ) -> QuadScan {
        let index = best_index(&self.permutations, &pattern);
        let permutation = self.permutations[index];
        let (lower, upper) = permutation.bounds(&pattern);
        let root = roots.get(index).copied().unwrap_or(0);
        QuadScan {
            inner: RangeScan::new(Arc::clone(&self.ctx.cache), reader, root, lower, upper),
            permutation,
            pattern,
        }
    }

    /// Number of quads, explicit and inferred.
    pub fn count(&self, roots: &[PageId]) -> Result<u64, BTreeError> {
        roots
            .first()
            .map_or(Ok(0), |&root| self.ctx.tree(root).count())
    }

    /// Bring the stored indexes in line with the configured permutations.
    ///
    /// Trees whose permutation is still configured are kept, new ones are
    /// built from the first kept (or stored) tree, and trees no longer
    /// configured are freed. Returns the roots in configured order and
    /// whether anything changed.
    pub fn reconcile(&self, stored: &[IndexRoot]) -> Result<(Vec<PageId>, bool), BTreeError> {
        let mut stored_perms = Vec::with_capacity(stored.len());
        for entry in stored {
            let permutation = Permutation::from_name(entry.name).map_err(|e| {
                BTreeError::Corrupt(format!("stored index name is invalid: {e}"))
            })?;
            stored_perms.push((permutation, entry.root));
        }
        let source = stored_perms.first().copied();

        let mut roots = Vec::with_capacity(self.permutations.len());
        let mut changed = stored.len() != self.permutations.len();
        for (i, permutation) in self.permutations.iter().enumerate() {
            if let Some(&(_, root)) = stored_perms.iter().find(|(p, _)| p == permutation) {
                changed |= stored_perms.get(i).map(|(p, _)| p) != Some(permutation);
                roots.push(root);
                continue;
            }
            changed = true;
            let root = match source {
                Some((from, from_root)) => self.rebuild(from, from_root, *permutation)?,
                None => 0,
            };
            tracing::info!(index = %permutation, "built index");
            roots.push(root);
        }

        for (permutation, root) in &stored_perms {
            if !self.permutations.contains(permutation) {
                self.ctx.tree(*root).free_all()?;
                tracing::info!(index = %permutation, "dropped index");
            }
        }
        Ok((roots, changed))
    }

    fn rebuild(
        &self,
        from: Permutation,
        from_root: PageId,
        to: Permutation,
    ) -> Result<PageId, BTreeError> {
        let scan = QuadScan {
            inner: RangeScan::new(
                Arc::clone(&self.ctx.cache),
                None,
                from_root,
                prefix_lower_bound(&[]),
                prefix_upper_bound(&[]),
            ),
            permutation: from,
            pattern: QuadPattern::default(),
        };
        let mut tree = self.ctx.tree(0);
        for entry in scan {
            let (quad, flags) = entry?;
            tree.insert(to.key(&quad), flags)?;
        }
        Ok(tree.root())
    }
}

/// True if `flags` mark an explicit statement.
#[must_use]
pub const fn is_explicit(flags: u8) -> bool {
    flags & FLAG_EXPLICIT != 0
}

/// Quads of one index matching a pattern, in key order.
///
/// The range scan covers the bound prefix; positions bound after the first
/// unbound field are filtered here.
pub struct QuadScan {
    inner: RangeScan,
    permutation: Permutation,
    pattern: QuadPattern,
}

impl CloseableIteration<(Quad, u8), BTreeError> for QuadScan {
    fn close(&mut self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Iterator for QuadScan {
    type Item = Result<(Quad, u8), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((key, flags)) => {
                    let quad = self.permutation.quad(&key);
                    if self.pattern.matches(&quad) {
                        return Some(Ok((quad, flags)));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::permutation::parse_permutations;
    use crate::simulation::SimulatedStorage;
    use crate::storage::{NodeCache, PageStore, PagerOptions, Reclaimer};
    use crate::types::TermId;

    fn index_set(list: &str) -> QuadIndexSet {
        let permutations = parse_permutations(list).expect("permutations");
        let pager = PageStore::create(
            Box::new(SimulatedStorage::new(3)),
            permutations
                .iter()
                .map(|p| IndexRoot {
                    name: p.name(),
                    root: 0,
                })
                .collect(),
            PagerOptions::default(),
        )
        .expect("create pager");
        let ctx = TreeContext {
            cache: NodeCache::new(Arc::new(pager), 256, 8),
            reclaimer: Reclaimer::new(),
            fanout: Some(4),
        };
        QuadIndexSet::new(permutations, ctx)
    }

    fn quad(s: u64, p: u64, o: u64, c: u64) -> Quad {
        Quad::from_ids([s, p, o, c])
    }

    fn collect(scan: QuadScan) -> Vec<Quad> {
        scan.map(|e| e.expect("scan").0).collect()
    }

    #[test]
    fn test_insert_reaches_every_index() {
        let set = index_set("spoc,posc,ospc");
        let mut roots = vec![0; 3];
        for s in 1..=20 {
            set.insert(&mut roots, &quad(s, s % 3 + 100, s % 5 + 200, 0), true)
                .expect("insert");
        }
        for &root in &roots {
            assert_eq!(set.context().tree(root).validate().expect("validate"), 20);
        }

        let by_predicate = collect(set.scan(
            &roots,
            QuadPattern {
                predicate: Some(TermId(101)),
                ..QuadPattern::default()
            },
            None,
        ));
        assert_eq!(by_predicate.len(), 7);
        assert!(by_predicate.iter().all(|q| q.predicate == TermId(101)));
    }

    #[test]
    fn test_non_prefix_positions_are_filtered() {
        let set = index_set("spoc");
        let mut roots = vec![0];
        set.insert(&mut roots, &quad(1, 2, 3, 0), true).expect("insert");
        set.insert(&mut roots, &quad(1, 2, 3, 9), true).expect("insert");
        set.insert(&mut roots, &quad(1, 5, 3, 0), true).expect("insert");

        let hits = collect(set.scan(
            &roots,
            QuadPattern {
                subject: Some(TermId(1)),
                context: Some(TermId::DEFAULT_GRAPH),
                ..QuadPattern::default()
            },
            None,
        ));
        assert_eq!(hits, vec![quad(1, 2, 3, 0), quad(1, 5, 3, 0)]);
    }

    #[test]
    fn test_flag_merge_and_kind_specific_removal() {
        let set = index_set("spoc,posc");
        let mut roots = vec![0; 2];
        let q = quad(1, 2, 3, 0);

        assert_eq!(set.insert(&mut roots, &q, false).expect("inferred"), None);
        assert_eq!(
            set.insert(&mut roots, &q, true).expect("explicit"),
            Some(FLAG_INFERRED)
        );
        assert_eq!(
            set.insert(&mut roots, &q, false).expect("inferred again"),
            Some(FLAG_EXPLICIT)
        );
        assert_eq!(set.get(&roots, &q).expect("get"), Some(FLAG_EXPLICIT));

        assert!(!set.remove(&mut roots, &q, false).expect("remove inferred"));
        assert!(set.remove(&mut roots, &q, true).expect("remove explicit"));
        assert_eq!(set.count(&roots).expect("count"), 0);
        assert_eq!(roots, vec![0, 0]);
    }

    #[test]
    fn test_reconcile_builds_and_drops_indexes() {
        let old = index_set("spoc,posc");
        let mut roots = vec![0; 2];
        for s in 1..=30 {
            old.insert(&mut roots, &quad(s, 7, s + 1, 0), s % 2 == 0)
                .expect("insert");
        }
        let stored = old.index_roots(&roots);

        let new = QuadIndexSet::new(
            parse_permutations("ospc,spoc").expect("permutations"),
            old.context().clone(),
        );
        let (new_roots, changed) = new.reconcile(&stored).expect("reconcile");
        assert!(changed);
        assert_eq!(new_roots[1], roots[0]);

        let tree = new.context().tree(new_roots[0]);
        assert_eq!(tree.validate().expect("validate"), 30);
        let by_object = collect(new.scan(
            &new_roots,
            QuadPattern {
                object: Some(TermId(11)),
                ..QuadPattern::default()
            },
            None,
        ));
        assert_eq!(by_object, vec![quad(10, 7, 11, 0)]);
        assert_eq!(
            new.get(&new_roots, &quad(10, 7, 11, 0)).expect("get"),
            Some(FLAG_EXPLICIT)
        );
        assert_eq!(
            new.get(&new_roots, &quad(9, 7, 10, 0)).expect("get"),
            Some(FLAG_INFERRED)
        );

        let (same, changed) = old.reconcile(&stored).expect("unchanged");
        assert!(!changed);
        assert_eq!(same, roots);
    }
}
