//! Prefix-bounded range scan.
//!
//! Nodes have no sibling pointers, so the scan keeps the pinned path from the
//! root to the current leaf. Moving past the end of a leaf pops back up the
//! path to the next unvisited child. Every node on the path stays pinned
//! until the scan leaves it.

use std::sync::Arc;

use crate::storage::btree::node::{Key, Node};
use crate::storage::btree::tree::BTreeError;
use crate::storage::node_cache::{NodeCache, PinnedNode};
use crate::storage::page::PageId;
use crate::storage::reclaim::ReaderGuard;

struct Frame {
    node: PinnedNode,
    /// Next entry (leaf) or next child (internal) to visit.
    next: usize,
}

/// Lazy scan over the keys in `[lower, upper]` of one tree.
pub struct RangeScan {
    cache: Arc<NodeCache>,
    upper: Key,
    path: Vec<Frame>,
    /// Root to descend from on the first call.
    pending_root: Option<(PageId, Key)>,
    reader: Option<ReaderGuard>,
    done: bool,
}

impl RangeScan {
    /// Scan the tree rooted at `root` for keys between `lower` and `upper`
    /// inclusive.
    ///
    /// `reader` keeps the scanned pages from being reused while the scan is
    /// open; it must have been registered before `root` was read.
    #[must_use]
    pub fn new(
        cache: Arc<NodeCache>,
        reader: Option<ReaderGuard>,
        root: PageId,
        lower: Key,
        upper: Key,
    ) -> Self {
        Self {
            cache,
            upper,
            path: Vec::new(),
            pending_root: (root != 0).then_some((root, lower)),
            reader,
            done: root == 0,
        }
    }

    /// Release every pinned node and stop.
    pub fn close(&mut self) {
        self.path.clear();
        self.pending_root = None;
        self.reader = None;
        self.done = true;
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.done
    }

    /// Descend from `page_id` to the first leaf entry not below `lower`.
    fn seek(&mut self, page_id: PageId, lower: &Key) -> Result<(), BTreeError> {
        let mut page_id = page_id;
        loop {
            let node = self.cache.pin(page_id)?;
            match &*node {
                Node::Internal(inner) => {
                    let index = inner.find_child_index(lower);
                    page_id = inner.children[index];
                    self.path.push(Frame {
                        node,
                        next: index + 1,
                    });
                }
                Node::Leaf(leaf) => {
                    let next = leaf.find_index(lower).unwrap_or_else(|i| i);
                    self.path.push(Frame { node, next });
                    return Ok(());
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Option<(Key, u8)>, BTreeError> {
        if let Some((root, lower)) = self.pending_root.take() {
            self.seek(root, &lower)?;
        }

        loop {
            let Some(frame) = self.path.last_mut() else {
                return Ok(None);
            };
            let step = match &*frame.node {
                Node::Leaf(leaf) => match leaf.entries.get(frame.next) {
                    Some(entry) if entry.key > self.upper => return Ok(None),
                    Some(entry) => {
                        frame.next += 1;
                        return Ok(Some((entry.key, entry.value)));
                    }
                    None => None,
                },
                Node::Internal(inner) => {
                    if frame.next >= inner.children.len() {
                        None
                    } else if inner.keys[frame.next - 1] > self.upper {
                        // Every later subtree starts beyond the bound.
                        return Ok(None);
                    } else {
                        let child = inner.children[frame.next];
                        frame.next += 1;
                        Some(child)
                    }
                }
            };

            match step {
                Some(child) => {
                    // Leftmost descent into the next subtree.
                    let mut page_id = child;
                    loop {
                        let node = self.cache.pin(page_id)?;
                        let next_child = match &*node {
                            Node::Internal(inner) => Some(inner.children[0]),
                            Node::Leaf(_) => None,
                        };
                        self.path.push(Frame {
                            node,
                            next: usize::from(next_child.is_some()),
                        });
                        match next_child {
                            Some(c) => page_id = c,
                            None => break,
                        }
                    }
                }
                None => {
                    self.path.pop();
                }
            }
        }
    }
}

impl Iterator for RangeScan {
    type Item = Result<(Key, u8), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedStorage;
    use crate::storage::btree::node::{FLAG_EXPLICIT, make_key, split_key};
    use crate::storage::btree::tree::{TreeContext, prefix_lower_bound, prefix_upper_bound};
    use crate::storage::pager::{PageStore, PagerOptions};
    use crate::storage::reclaim::Reclaimer;
    use crate::storage::superblock::IndexRoot;

    fn context(fanout: Option<usize>, cache_size: usize) -> TreeContext {
        let pager = PageStore::create(
            Box::new(SimulatedStorage::new(1)),
            vec![IndexRoot {
                name: *b"spoc",
                root: 0,
            }],
            PagerOptions::default(),
        )
        .expect("create pager");
        TreeContext {
            cache: NodeCache::new(Arc::new(pager), cache_size, 0),
            reclaimer: Reclaimer::new(),
            fanout,
        }
    }

    fn scan_prefix(ctx: &TreeContext, root: PageId, prefix: &[u64]) -> Vec<[u64; 4]> {
        RangeScan::new(
            Arc::clone(&ctx.cache),
            None,
            root,
            prefix_lower_bound(prefix),
            prefix_upper_bound(prefix),
        )
        .map(|entry| split_key(&entry.expect("scan").0))
        .collect()
    }

    #[test]
    fn test_prefix_scan_stops_after_prefix() {
        let ctx = context(None, 64);
        let mut tree = ctx.tree(0);
        for ids in [[1, 1, 1, 0], [1, 1, 2, 0], [1, 2, 1, 0], [2, 1, 1, 0]] {
            tree.insert(make_key(ids), FLAG_EXPLICIT).expect("insert");
        }

        let found = scan_prefix(&ctx, tree.root(), &[1, 1]);
        assert_eq!(found, vec![[1, 1, 1, 0], [1, 1, 2, 0]]);
    }

    #[test]
    fn test_scan_across_many_leaves() {
        let ctx = context(Some(4), 256);
        let mut tree = ctx.tree(0);
        for a in 0..10 {
            for b in 0..10 {
                tree.insert(make_key([a, b, 0, 0]), FLAG_EXPLICIT)
                    .expect("insert");
            }
        }

        let found = scan_prefix(&ctx, tree.root(), &[7]);
        let expected: Vec<[u64; 4]> = (0..10).map(|b| [7, b, 0, 0]).collect();
        assert_eq!(found, expected);

        assert_eq!(scan_prefix(&ctx, tree.root(), &[]).len(), 100);
        assert!(scan_prefix(&ctx, tree.root(), &[42]).is_empty());
        assert!(scan_prefix(&ctx, 0, &[1]).is_empty());
    }

    #[test]
    fn test_scan_pins_path_and_releases_on_close() {
        let ctx = context(Some(4), 256);
        let mut tree = ctx.tree(0);
        for a in 0..50 {
            tree.insert(make_key([a, 0, 0, 0]), FLAG_EXPLICIT)
                .expect("insert");
        }
        let root = tree.root();

        let mut scan = RangeScan::new(
            Arc::clone(&ctx.cache),
            None,
            root,
            prefix_lower_bound(&[]),
            prefix_upper_bound(&[]),
        );
        assert!(scan.next().is_some());
        assert_eq!(ctx.cache.usage(root).expect("usage"), 1);
        assert!(ctx.cache.stats().expect("stats").pinned >= 2);

        scan.close();
        scan.close();
        assert!(scan.next().is_none());
        assert_eq!(ctx.cache.stats().expect("stats").pinned, 0);
    }

    fn commit(ctx: &TreeContext, root: PageId) -> Vec<PageId> {
        ctx.cache.flush().expect("flush");
        ctx.cache
            .pager()
            .commit(
                vec![IndexRoot {
                    name: *b"spoc",
                    root,
                }],
                0,
                &ctx.reclaimer.pending().expect("pending"),
            )
            .expect("commit")
            .retired
    }

    #[test]
    fn test_scan_survives_writer_and_cache_pressure() {
        let ctx = context(Some(4), 8);
        let mut tree = ctx.tree(0);
        for a in 0..40 {
            tree.insert(make_key([a, 0, 0, 0]), FLAG_EXPLICIT)
                .expect("insert");
        }
        let root = tree.root();
        commit(&ctx, root);

        let reader = ctx.reclaimer.register().expect("register");
        let mut scan = RangeScan::new(
            Arc::clone(&ctx.cache),
            Some(reader),
            root,
            prefix_lower_bound(&[]),
            prefix_upper_bound(&[]),
        );
        let first = scan.next().expect("entry").expect("scan");
        assert_eq!(split_key(&first.0)[0], 0);

        // The writer rewrites the tree and grows it well past the cache cap.
        for a in 0..40 {
            tree.delete(&make_key([a, 0, 0, 0])).expect("delete");
        }
        for a in 100..300 {
            tree.insert(make_key([a, 0, 0, 0]), FLAG_EXPLICIT)
                .expect("insert");
        }
        let retired = commit(&ctx, tree.root());
        assert!(!retired.is_empty());
        ctx.reclaimer.retire(retired).expect("retire");
        // The open scan holds every retired page back.
        assert_eq!(ctx.reclaimer.reclaim(&ctx.cache).expect("reclaim"), 0);

        for a in 300..400 {
            tree.insert(make_key([a, 0, 0, 0]), FLAG_EXPLICIT)
                .expect("insert");
        }

        // The open scan still sees the tree it started on.
        let rest: Vec<u64> = scan.map(|e| split_key(&e.expect("scan").0)[0]).collect();
        assert_eq!(rest, (1..40).collect::<Vec<_>>());
        assert_eq!(tree.validate().expect("valid"), 300);
        assert!(ctx.reclaimer.reclaim(&ctx.cache).expect("reclaim") > 0);
    }

    #[test]
    fn test_scan_of_working_tree_ignores_later_splits() {
        let ctx = context(Some(4), 256);
        let mut tree = ctx.tree(0);
        for a in (0..40).step_by(2) {
            tree.insert(make_key([a, 0, 0, 0]), FLAG_EXPLICIT)
                .expect("insert");
        }

        let reader = ctx.reclaimer.register_working().expect("register");
        let mut scan = RangeScan::new(
            Arc::clone(&ctx.cache),
            Some(reader),
            tree.root(),
            prefix_lower_bound(&[]),
            prefix_upper_bound(&[]),
        );
        let first = scan.next().expect("entry").expect("scan");
        assert_eq!(split_key(&first.0)[0], 0);

        // Filling the gaps splits every uncommitted leaf the scan has not
        // reached yet.
        for a in (1..40).step_by(2) {
            tree.insert(make_key([a, 0, 0, 0]), FLAG_EXPLICIT)
                .expect("insert");
        }

        let rest: Vec<u64> = scan.map(|e| split_key(&e.expect("scan").0)[0]).collect();
        assert_eq!(rest, (2..40).step_by(2).collect::<Vec<_>>());
        assert_eq!(tree.validate().expect("valid"), 40);
    }
}
