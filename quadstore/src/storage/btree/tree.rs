//! Copy-on-write B-tree over the node cache.
//!
//! A tree is identified by its root node id; 0 is the empty tree. Every
//! mutating operation returns with `root()` naming the new root, and nothing
//! reachable from the previous root has changed unless that node was
//! allocated by the running transaction and nobody had it pinned.
//!
//! # Design
//!
//! - Descent is recursive; each level reports back whether its node moved to
//!   a new page or split, and the parent is rewritten only when it did.
//! - Splits happen at the median when a node exceeds its capacity. A node
//!   below half capacity borrows from a sibling when the sibling can spare a
//!   key, otherwise it merges with it.
//! - Pages leaving the tree are retired through the page store: committed
//!   pages return to the free set after the next commit, pages allocated in
//!   the running transaction are queued for reclamation immediately.

use std::sync::Arc;

use crate::storage::btree::node::{
    InternalNode, KEY_SIZE, Key, LeafEntry, LeafNode, MAX_INTERNAL_KEYS, MAX_LEAF_ENTRIES, Node,
    NodeError,
};
use crate::storage::io::StorageError;
use crate::storage::node_cache::{CacheError, NodeCache};
use crate::storage::page::PageId;
use crate::storage::pager::Retirement;
use crate::storage::reclaim::Reclaimer;

/// Smallest fanout a tree accepts.
pub const MIN_FANOUT: usize = 4;

/// Result of an insert below a node.
enum InsertOutcome {
    /// The key was present with the same value; nothing was written.
    Unchanged(u8),
    Changed {
        old: Option<u8>,
        page_id: PageId,
        split: Option<(Key, PageId)>,
    },
}

/// Result of a delete below a node.
struct DeleteOutcome {
    old: u8,
    page_id: PageId,
    underfull: bool,
}

/// A B-tree rooted at `root`, mutated through the node cache.
pub struct BTree<'a> {
    cache: &'a NodeCache,
    reclaimer: &'a Reclaimer,
    root: PageId,
    max_leaf: usize,
    max_internal: usize,
}

impl<'a> BTree<'a> {
    /// Open the tree rooted at `root` (0 for an empty tree) with full-page fanout.
    #[must_use]
    pub const fn new(cache: &'a NodeCache, reclaimer: &'a Reclaimer, root: PageId) -> Self {
        Self {
            cache,
            reclaimer,
            root,
            max_leaf: MAX_LEAF_ENTRIES,
            max_internal: MAX_INTERNAL_KEYS,
        }
    }

    /// Limit every node to `fanout` keys (clamped to what fits in a page).
    #[must_use]
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        let fanout = fanout.max(MIN_FANOUT);
        self.max_leaf = fanout.min(MAX_LEAF_ENTRIES);
        self.max_internal = fanout.min(MAX_INTERNAL_KEYS);
        self
    }

    /// Current root node id.
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.root
    }

    const fn min_leaf(&self) -> usize {
        self.max_leaf / 2
    }

    const fn min_internal(&self) -> usize {
        self.max_internal / 2
    }

    fn is_underfull(&self, node: &Node) -> bool {
        match node {
            Node::Leaf(leaf) => leaf.entries.len() < self.min_leaf(),
            Node::Internal(inner) => inner.keys.len() < self.min_internal(),
        }
    }

    fn can_lend(&self, node: &Node) -> bool {
        match node {
            Node::Leaf(leaf) => leaf.entries.len() > self.min_leaf(),
            Node::Internal(inner) => inner.keys.len() > self.min_internal(),
        }
    }

    /// True if `key` is present.
    pub fn search(&self, key: &Key) -> Result<bool, BTreeError> {
        Ok(self.get(key)?.is_some())
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &Key) -> Result<Option<u8>, BTreeError> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut page_id = self.root;
        loop {
            let node = self.cache.read(page_id)?;
            match &*node {
                Node::Internal(inner) => {
                    page_id = inner.children[inner.find_child_index(key)];
                }
                Node::Leaf(leaf) => return Ok(leaf.get(key)),
            }
        }
    }

    /// Store `node` for the page it replaces.
    ///
    /// The page is reused when it was allocated by the running transaction,
    /// no reader has it pinned and nobody is reading the working trees (a
    /// scan may hold an ancestor that still lists the old children).
    /// Otherwise the node moves to a new page.
    fn write_node(&self, old: Option<PageId>, node: Node) -> Result<PageId, BTreeError> {
        let pager = self.cache.pager();
        if let Some(page_id) = old
            && self.cache.usage(page_id)? == 0
            && pager.is_fresh(page_id)?
            && !self.reclaimer.has_working_readers()?
        {
            self.cache.put(page_id, node)?;
            return Ok(page_id);
        }

        let page_id = pager.allocate()?;
        self.cache.put(page_id, node)?;
        if let Some(old) = old {
            self.retire(old)?;
        }
        Ok(page_id)
    }

    fn retire(&self, page_id: PageId) -> Result<(), BTreeError> {
        if self.cache.pager().retire(page_id)? == Retirement::Fresh {
            self.reclaimer.retire([page_id])?;
        }
        Ok(())
    }

    /// Insert `key` with `value`, or merge `value` into the present flags.
    ///
    /// Flags merge by bitwise or, so an explicit flag is never downgraded.
    /// Returns the previous value.
    pub fn insert(&mut self, key: Key, value: u8) -> Result<Option<u8>, BTreeError> {
        if self.root == 0 {
            let leaf = LeafNode {
                entries: vec![LeafEntry { key, value }],
            };
            self.root = self.write_node(None, Node::Leaf(leaf))?;
            return Ok(None);
        }

        match self.insert_below(self.root, key, value)? {
            InsertOutcome::Unchanged(old) => Ok(Some(old)),
            InsertOutcome::Changed {
                old,
                page_id,
                split,
            } => {
                self.root = match split {
                    Some((separator, right)) => {
                        let root = InternalNode::with_children(page_id, separator, right);
                        self.write_node(None, Node::Internal(root))?
                    }
                    None => page_id,
                };
                Ok(old)
            }
        }
    }

    fn insert_below(
        &self,
        page_id: PageId,
        key: Key,
        value: u8,
    ) -> Result<InsertOutcome, BTreeError> {
        let node = self.cache.read(page_id)?;
        match &*node {
            Node::Leaf(leaf) => {
                let mut leaf = leaf.clone();
                let old = match leaf.find_index(&key) {
                    Ok(i) => {
                        let old = leaf.entries[i].value;
                        let merged = old | value;
                        if merged == old {
                            return Ok(InsertOutcome::Unchanged(old));
                        }
                        leaf.entries[i].value = merged;
                        Some(old)
                    }
                    Err(i) => {
                        leaf.entries.insert(i, LeafEntry { key, value });
                        None
                    }
                };

                let split = if leaf.entries.len() > self.max_leaf {
                    let (separator, right) = leaf.split();
                    Some((separator, self.write_node(None, Node::Leaf(right))?))
                } else {
                    None
                };
                let page_id = self.write_node(Some(page_id), Node::Leaf(leaf))?;
                Ok(InsertOutcome::Changed {
                    old,
                    page_id,
                    split,
                })
            }
            Node::Internal(inner) => {
                let index = inner.find_child_index(&key);
                let child = inner.children[index];
                let (old, child_id, child_split) = match self.insert_below(child, key, value)? {
                    InsertOutcome::Unchanged(old) => return Ok(InsertOutcome::Unchanged(old)),
                    InsertOutcome::Changed {
                        old,
                        page_id,
                        split,
                    } => (old, page_id, split),
                };
                if child_id == child && child_split.is_none() {
                    return Ok(InsertOutcome::Changed {
                        old,
                        page_id,
                        split: None,
                    });
                }

                let mut inner = inner.clone();
                inner.children[index] = child_id;
                if let Some((separator, right)) = child_split {
                    inner.keys.insert(index, separator);
                    inner.children.insert(index + 1, right);
                }

                let split = if inner.keys.len() > self.max_internal {
                    let (median, right) = inner.split();
                    Some((median, self.write_node(None, Node::Internal(right))?))
                } else {
                    None
                };
                let page_id = self.write_node(Some(page_id), Node::Internal(inner))?;
                Ok(InsertOutcome::Changed {
                    old,
                    page_id,
                    split,
                })
            }
        }
    }

    /// Remove `key`. Returns the removed value.
    pub fn delete(&mut self, key: &Key) -> Result<Option<u8>, BTreeError> {
        if self.root == 0 {
            return Ok(None);
        }
        let Some(outcome) = self.delete_below(self.root, key)? else {
            return Ok(None);
        };
        self.root = outcome.page_id;

        // Collapse a root left without keys.
        let root = self.cache.read(self.root)?;
        match &*root {
            Node::Internal(inner) if inner.keys.is_empty() => {
                let old_root = self.root;
                self.root = inner.children[0];
                self.retire(old_root)?;
            }
            Node::Leaf(leaf) if leaf.entries.is_empty() => {
                let old_root = self.root;
                self.root = 0;
                self.retire(old_root)?;
            }
            _ => {}
        }
        Ok(Some(outcome.old))
    }

    fn delete_below(
        &self,
        page_id: PageId,
        key: &Key,
    ) -> Result<Option<DeleteOutcome>, BTreeError> {
        let node = self.cache.read(page_id)?;
        match &*node {
            Node::Leaf(leaf) => {
                let Ok(index) = leaf.find_index(key) else {
                    return Ok(None);
                };
                let mut leaf = leaf.clone();
                let old = leaf.entries.remove(index).value;
                let underfull = leaf.entries.len() < self.min_leaf();
                let page_id = self.write_node(Some(page_id), Node::Leaf(leaf))?;
                Ok(Some(DeleteOutcome {
                    old,
                    page_id,
                    underfull,
                }))
            }
            Node::Internal(inner) => {
                let index = inner.find_child_index(key);
                let child = inner.children[index];
                let Some(outcome) = self.delete_below(child, key)? else {
                    return Ok(None);
                };
                if outcome.page_id == child && !outcome.underfull {
                    return Ok(Some(DeleteOutcome {
                        old: outcome.old,
                        page_id,
                        underfull: false,
                    }));
                }

                let mut inner = inner.clone();
                inner.children[index] = outcome.page_id;
                if outcome.underfull {
                    self.rebalance(&mut inner, index)?;
                }
                let underfull = inner.keys.len() < self.min_internal();
                let page_id = self.write_node(Some(page_id), Node::Internal(inner))?;
                Ok(Some(DeleteOutcome {
                    old: outcome.old,
                    page_id,
                    underfull,
                }))
            }
        }
    }

    /// Fix the underfull child at `index` of `parent`.
    fn rebalance(&self, parent: &mut InternalNode, index: usize) -> Result<(), BTreeError> {
        let child_id = parent.children[index];
        let child = self.cache.read(child_id)?;

        if index > 0 {
            let left_id = parent.children[index - 1];
            let left = self.cache.read(left_id)?;
            if self.can_lend(&left) {
                let (left, child) = self.borrow_from_left(parent, index, &left, &child)?;
                parent.children[index - 1] = self.write_node(Some(left_id), left)?;
                parent.children[index] = self.write_node(Some(child_id), child)?;
                return Ok(());
            }
        }

        if index + 1 < parent.children.len() {
            let right_id = parent.children[index + 1];
            let right = self.cache.read(right_id)?;
            if self.can_lend(&right) {
                let (child, right) = self.borrow_from_right(parent, index, &child, &right)?;
                parent.children[index] = self.write_node(Some(child_id), child)?;
                parent.children[index + 1] = self.write_node(Some(right_id), right)?;
                return Ok(());
            }
        }

        // Neither sibling can lend: merge with one of them.
        let left_index = if index > 0 { index - 1 } else { index };
        if left_index + 1 >= parent.children.len() {
            // Only child; the caller collapses or tolerates it.
            return Ok(());
        }
        let left_id = parent.children[left_index];
        let right_id = parent.children[left_index + 1];
        let left = self.cache.read(left_id)?;
        let right = self.cache.read(right_id)?;
        let separator = parent.keys.remove(left_index);
        parent.children.remove(left_index + 1);

        let merged = match (&*left, &*right) {
            (Node::Leaf(l), Node::Leaf(r)) => {
                let mut merged = l.clone();
                merged.entries.extend_from_slice(&r.entries);
                Node::Leaf(merged)
            }
            (Node::Internal(l), Node::Internal(r)) => {
                let mut merged = l.clone();
                merged.keys.push(separator);
                merged.keys.extend_from_slice(&r.keys);
                merged.children.extend_from_slice(&r.children);
                Node::Internal(merged)
            }
            _ => return Err(BTreeError::Corrupt("siblings at different depths".into())),
        };
        parent.children[left_index] = self.write_node(Some(left_id), merged)?;
        self.retire(right_id)?;
        Ok(())
    }

    #[allow(clippy::unused_self)] // keeps the three rebalance steps on the tree
    fn borrow_from_left(
        &self,
        parent: &mut InternalNode,
        index: usize,
        left: &Node,
        child: &Node,
    ) -> Result<(Node, Node), BTreeError> {
        match (left, child) {
            (Node::Leaf(l), Node::Leaf(c)) => {
                let (mut l, mut c) = (l.clone(), c.clone());
                let moved = l
                    .entries
                    .pop()
                    .ok_or_else(|| BTreeError::Corrupt("empty left sibling".into()))?;
                c.entries.insert(0, moved);
                parent.keys[index - 1] = moved.key;
                Ok((Node::Leaf(l), Node::Leaf(c)))
            }
            (Node::Internal(l), Node::Internal(c)) => {
                let (mut l, mut c) = (l.clone(), c.clone());
                let (Some(key), Some(grandchild)) = (l.keys.pop(), l.children.pop()) else {
                    return Err(BTreeError::Corrupt("empty left sibling".into()));
                };
                c.keys.insert(0, parent.keys[index - 1]);
                c.children.insert(0, grandchild);
                parent.keys[index - 1] = key;
                Ok((Node::Internal(l), Node::Internal(c)))
            }
            _ => Err(BTreeError::Corrupt("siblings at different depths".into())),
        }
    }

    #[allow(clippy::unused_self)] // keeps the three rebalance steps on the tree
    fn borrow_from_right(
        &self,
        parent: &mut InternalNode,
        index: usize,
        child: &Node,
        right: &Node,
    ) -> Result<(Node, Node), BTreeError> {
        match (child, right) {
            (Node::Leaf(c), Node::Leaf(r)) => {
                let (mut c, mut r) = (c.clone(), r.clone());
                if r.entries.len() < 2 {
                    return Err(BTreeError::Corrupt("right sibling cannot lend".into()));
                }
                c.entries.push(r.entries.remove(0));
                parent.keys[index] = r.entries[0].key;
                Ok((Node::Leaf(c), Node::Leaf(r)))
            }
            (Node::Internal(c), Node::Internal(r)) => {
                let (mut c, mut r) = (c.clone(), r.clone());
                if r.keys.is_empty() {
                    return Err(BTreeError::Corrupt("right sibling cannot lend".into()));
                }
                c.keys.push(parent.keys[index]);
                c.children.push(r.children.remove(0));
                parent.keys[index] = r.keys.remove(0);
                Ok((Node::Internal(c), Node::Internal(r)))
            }
            _ => Err(BTreeError::Corrupt("siblings at different depths".into())),
        }
    }

    /// Number of entries in the tree.
    pub fn count(&self) -> Result<u64, BTreeError> {
        if self.root == 0 {
            return Ok(0);
        }
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(page_id) = stack.pop() {
            match &*self.cache.read(page_id)? {
                Node::Internal(inner) => stack.extend_from_slice(&inner.children),
                Node::Leaf(leaf) => count += leaf.entries.len() as u64,
            }
        }
        Ok(count)
    }

    /// Retire every page of the tree and leave it empty.
    pub fn free_all(&mut self) -> Result<(), BTreeError> {
        if self.root == 0 {
            return Ok(());
        }
        let mut stack = vec![self.root];
        while let Some(page_id) = stack.pop() {
            if let Node::Internal(inner) = &*self.cache.read(page_id)? {
                stack.extend_from_slice(&inner.children);
            }
            self.retire(page_id)?;
        }
        self.root = 0;
        Ok(())
    }

    /// Check the structural invariants. Returns the number of entries.
    ///
    /// Checks key order, separator bounds, child counts, node fill (the
    /// root excepted) and that all leaves share one depth.
    pub fn validate(&self) -> Result<u64, BTreeError> {
        if self.root == 0 {
            return Ok(0);
        }
        let mut leaf_depth = None;
        self.validate_node(self.root, None, None, 0, &mut leaf_depth)
    }

    fn validate_node(
        &self,
        page_id: PageId,
        lower: Option<Key>,
        upper: Option<Key>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<u64, BTreeError> {
        let node = self.cache.read(page_id)?;
        let is_root = page_id == self.root;
        let invalid = |msg: String| Err(BTreeError::Corrupt(format!("node {page_id}: {msg}")));

        let keys: Vec<Key> = match &*node {
            Node::Internal(inner) => inner.keys.clone(),
            Node::Leaf(leaf) => leaf.entries.iter().map(|e| e.key).collect(),
        };
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return invalid("keys out of order".into());
        }
        if let (Some(lower), Some(first)) = (lower, keys.first())
            && *first < lower
        {
            return invalid("key below separator".into());
        }
        if let (Some(upper), Some(last)) = (upper, keys.last())
            && *last >= upper
        {
            return invalid("key at or above separator".into());
        }
        if !is_root && self.is_underfull(&node) {
            return invalid(format!("underfull with {} keys", node.len()));
        }

        match &*node {
            Node::Leaf(leaf) => {
                if leaf.entries.len() > self.max_leaf {
                    return invalid("overfull leaf".into());
                }
                match *leaf_depth {
                    Some(d) if d != depth => return invalid("leaves at different depths".into()),
                    Some(_) => {}
                    None => *leaf_depth = Some(depth),
                }
                Ok(leaf.entries.len() as u64)
            }
            Node::Internal(inner) => {
                if inner.children.len() != inner.keys.len() + 1 {
                    return invalid("child count does not match key count".into());
                }
                if inner.keys.is_empty() || inner.keys.len() > self.max_internal {
                    return invalid(format!("internal node with {} keys", inner.keys.len()));
                }
                let mut total = 0;
                for (i, &child) in inner.children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(inner.keys[i - 1]) };
                    let hi = inner.keys.get(i).copied().or(upper);
                    total += self.validate_node(child, lo, hi, depth + 1, leaf_depth)?;
                }
                Ok(total)
            }
        }
    }
}

/// Smallest key starting with `prefix` (remaining fields zero).
#[must_use]
pub fn prefix_lower_bound(prefix: &[u64]) -> Key {
    let mut key = [0u8; KEY_SIZE];
    for (chunk, id) in key.chunks_exact_mut(8).zip(prefix) {
        chunk.copy_from_slice(&id.to_be_bytes());
    }
    key
}

/// Largest key starting with `prefix` (remaining fields all ones).
#[must_use]
pub fn prefix_upper_bound(prefix: &[u64]) -> Key {
    let mut key = [0xFFu8; KEY_SIZE];
    for (chunk, id) in key.chunks_exact_mut(8).zip(prefix) {
        chunk.copy_from_slice(&id.to_be_bytes());
    }
    key
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Page store error.
    Storage(StorageError),
    /// Node decoding error.
    Node(NodeError),
    /// Node cache lock poisoned.
    LockPoisoned,
    /// The tree violates a structural invariant.
    Corrupt(String),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::LockPoisoned => write!(f, "node cache lock poisoned"),
            Self::Corrupt(msg) => write!(f, "corrupt tree: {msg}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::LockPoisoned | Self::Corrupt(_) => None,
        }
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<CacheError> for BTreeError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Storage(e) => Self::Storage(e),
            CacheError::Node(e) => Self::Node(e),
            CacheError::LockPoisoned => Self::LockPoisoned,
        }
    }
}

/// Shared handles a tree needs, for callers that keep them together.
#[derive(Clone)]
pub struct TreeContext {
    pub cache: Arc<NodeCache>,
    pub reclaimer: Arc<Reclaimer>,
    pub fanout: Option<usize>,
}

impl TreeContext {
    /// Open the tree rooted at `root`.
    #[must_use]
    pub fn tree(&self, root: PageId) -> BTree<'_> {
        let tree = BTree::new(&self.cache, &self.reclaimer, root);
        match self.fanout {
            Some(fanout) => tree.with_fanout(fanout),
            None => tree,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedStorage;
    use crate::storage::btree::node::{FLAG_EXPLICIT, FLAG_INFERRED, make_key};
    use crate::storage::pager::{PageStore, PagerOptions};
    use crate::storage::superblock::IndexRoot;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn context(fanout: Option<usize>) -> TreeContext {
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
            cache: NodeCache::new(Arc::new(pager), 1024, 16),
            reclaimer: Reclaimer::new(),
            fanout,
        }
    }

    fn key(a: u64, b: u64, c: u64) -> Key {
        make_key([a, b, c, 0])
    }

    fn leaves_in_order(ctx: &TreeContext, root: PageId) -> Vec<Key> {
        fn walk(ctx: &TreeContext, page_id: PageId, out: &mut Vec<Key>) {
            match &*ctx.cache.read(page_id).expect("read") {
                Node::Internal(inner) => {
                    for &child in &inner.children {
                        walk(ctx, child, out);
                    }
                }
                Node::Leaf(leaf) => out.extend(leaf.entries.iter().map(|e| e.key)),
            }
        }
        let mut out = Vec::new();
        if root != 0 {
            walk(ctx, root, &mut out);
        }
        out
    }

    #[test]
    fn test_btree_basic_operations() {
        let ctx = context(None);
        let mut tree = ctx.tree(0);

        assert_eq!(tree.insert(key(1, 1, 1), FLAG_EXPLICIT).expect("insert"), None);
        assert_eq!(tree.insert(key(2, 2, 2), FLAG_EXPLICIT).expect("insert"), None);
        assert!(tree.search(&key(1, 1, 1)).expect("search"));
        assert!(!tree.search(&key(3, 3, 3)).expect("search"));
        assert_eq!(tree.count().expect("count"), 2);
    }

    #[test]
    fn test_insert_is_idempotent_and_explicit_wins() {
        let ctx = context(None);
        let mut tree = ctx.tree(0);
        let k = key(1, 2, 3);

        tree.insert(k, FLAG_INFERRED).expect("insert");
        let root = tree.root();
        assert_eq!(
            tree.insert(k, FLAG_INFERRED).expect("insert"),
            Some(FLAG_INFERRED)
        );
        assert_eq!(tree.root(), root);

        assert_eq!(
            tree.insert(k, FLAG_EXPLICIT).expect("insert"),
            Some(FLAG_INFERRED)
        );
        assert_eq!(tree.get(&k).expect("get"), Some(FLAG_EXPLICIT));
        // Inferred over explicit changes nothing.
        tree.insert(k, FLAG_INFERRED).expect("insert");
        assert_eq!(tree.get(&k).expect("get"), Some(FLAG_EXPLICIT));
        assert_eq!(tree.count().expect("count"), 1);
    }

    #[test]
    fn test_splits_grow_height_and_keep_order() {
        let ctx = context(Some(4));
        let mut tree = ctx.tree(0);
        for i in (0..200).rev() {
            tree.insert(key(i, 0, 0), FLAG_EXPLICIT).expect("insert");
        }
        assert_eq!(tree.validate().expect("valid"), 200);

        let keys = leaves_in_order(&ctx, tree.root());
        let expected: Vec<Key> = (0..200).map(|i| key(i, 0, 0)).collect();
        assert_eq!(keys, expected);
        assert!(matches!(
            &*ctx.cache.read(tree.root()).expect("root"),
            Node::Internal(_)
        ));
    }

    #[test]
    fn test_delete_borrows_and_merges() {
        let ctx = context(Some(4));
        let mut tree = ctx.tree(0);
        for i in 0..64 {
            tree.insert(key(i, 0, 0), FLAG_EXPLICIT).expect("insert");
        }

        // Removing from the front forces borrows from the right, then merges.
        for i in 0..60 {
            assert_eq!(
                tree.delete(&key(i, 0, 0)).expect("delete"),
                Some(FLAG_EXPLICIT)
            );
            assert_eq!(tree.validate().expect("valid"), 63 - i);
        }
        assert_eq!(tree.delete(&key(0, 0, 0)).expect("delete"), None);

        // Removing from the back forces borrows from the left.
        for i in (60..64).rev() {
            tree.delete(&key(i, 0, 0)).expect("delete");
            tree.validate().expect("valid");
        }
        assert_eq!(tree.root(), 0);
        assert_eq!(tree.count().expect("count"), 0);
    }

    #[test]
    fn test_root_collapses_to_single_leaf() {
        let ctx = context(Some(4));
        let mut tree = ctx.tree(0);
        for i in 0..5 {
            tree.insert(key(i, 0, 0), FLAG_EXPLICIT).expect("insert");
        }
        assert!(matches!(
            &*ctx.cache.read(tree.root()).expect("root"),
            Node::Internal(_)
        ));
        for i in 0..3 {
            tree.delete(&key(i, 0, 0)).expect("delete");
        }
        assert!(matches!(
            &*ctx.cache.read(tree.root()).expect("root"),
            Node::Leaf(_)
        ));
        assert_eq!(tree.validate().expect("valid"), 2);
    }

    #[test]
    fn test_random_operations_match_model() {
        let ctx = context(Some(6));
        let mut tree = ctx.tree(0);
        let mut model = BTreeSet::new();
        let mut rng = StdRng::seed_from_u64(0x5EED);

        for step in 0..3000 {
            let k = key(rng.random_range(0..40), rng.random_range(0..40), 0);
            if rng.random_bool(0.6) {
                let was_new = model.insert(k);
                let old = tree.insert(k, FLAG_EXPLICIT).expect("insert");
                assert_eq!(old.is_none(), was_new);
            } else {
                let removed = model.remove(&k);
                let old = tree.delete(&k).expect("delete");
                assert_eq!(old.is_some(), removed);
            }
            if step % 250 == 0 {
                assert_eq!(tree.validate().expect("valid"), model.len() as u64);
            }
        }

        assert_eq!(tree.validate().expect("valid"), model.len() as u64);
        let keys = leaves_in_order(&ctx, tree.root());
        assert_eq!(keys, model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_committed_nodes_are_copied_not_mutated() {
        let ctx = context(Some(4));
        let mut tree = ctx.tree(0);
        for i in 0..20 {
            tree.insert(key(i, 0, 0), FLAG_EXPLICIT).expect("insert");
        }
        let old_root = tree.root();
        ctx.cache.flush().expect("flush");
        ctx.cache
            .pager()
            .commit(
                vec![IndexRoot {
                    name: *b"spoc",
                    root: old_root,
                }],
                0,
                &[],
            )
            .expect("commit");

        tree.insert(key(100, 0, 0), FLAG_EXPLICIT).expect("insert");
        assert_ne!(tree.root(), old_root);

        // The committed tree is unchanged.
        let committed = ctx.tree(old_root);
        assert_eq!(committed.count().expect("count"), 20);
        assert!(!committed.search(&key(100, 0, 0)).expect("search"));
        assert_eq!(tree.count().expect("count"), 21);
    }

    #[test]
    fn test_fresh_unpinned_nodes_are_reused() {
        let ctx = context(None);
        let mut tree = ctx.tree(0);
        tree.insert(key(1, 0, 0), FLAG_EXPLICIT).expect("insert");
        let root = tree.root();
        tree.insert(key(2, 0, 0), FLAG_EXPLICIT).expect("insert");
        assert_eq!(tree.root(), root);

        // A pinned fresh node is copied instead.
        let pin = ctx.cache.pin(root).expect("pin");
        tree.insert(key(3, 0, 0), FLAG_EXPLICIT).expect("insert");
        assert_ne!(tree.root(), root);
        assert_eq!(pin.len(), 2);
        drop(pin);

        // So is every node while someone reads the working trees.
        let reader = ctx.reclaimer.register_working().expect("register");
        let root = tree.root();
        tree.insert(key(4, 0, 0), FLAG_EXPLICIT).expect("insert");
        assert_ne!(tree.root(), root);
        drop(reader);

        let root = tree.root();
        tree.insert(key(5, 0, 0), FLAG_EXPLICIT).expect("insert");
        assert_eq!(tree.root(), root);
    }

    #[test]
    fn test_free_all_retires_every_page() {
        let ctx = context(Some(4));
        let mut tree = ctx.tree(0);
        for i in 0..30 {
            tree.insert(key(i, 0, 0), FLAG_EXPLICIT).expect("insert");
        }
        let before = ctx.cache.pager().stats().expect("stats").fresh_pages;
        assert!(before > 0);
        tree.free_all().expect("free all");
        assert_eq!(tree.root(), 0);
        assert_eq!(ctx.cache.pager().stats().expect("stats").fresh_pages, 0);
        assert!(ctx.reclaimer.reclaim(&ctx.cache).expect("reclaim") as u64 >= before);
    }

    #[test]
    fn test_prefix_bounds() {
        assert_eq!(prefix_lower_bound(&[1, 1]), make_key([1, 1, 0, 0]));
        assert_eq!(
            prefix_upper_bound(&[1, 1]),
            make_key([1, 1, u64::MAX, u64::MAX])
        );
        assert_eq!(prefix_upper_bound(&[]), [0xFF; KEY_SIZE]);
    }
}
