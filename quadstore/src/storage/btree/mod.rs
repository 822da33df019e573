//! B-tree implementation for the permutation indexes.
//!
//! # Structure
//!
//! The B-tree consists of:
//! - Internal nodes: store keys and child node ids
//! - Leaf nodes: store keys and a one-byte flag value
//!
//! Nodes are copied to fresh pages before they change unless the running
//! transaction allocated them and no reader has them pinned, so a committed
//! root always names an intact tree.
//!
//! # Key Format
//!
//! Keys are 32 bytes: four term ids, big-endian, in permutation order.
//!
//! # Usage
//!
//! ```
//! use quadstore::storage::btree::{make_key, split_key, KEY_SIZE};
//!
//! let key = make_key([1, 2, 3, 0]);
//! assert_eq!(key.len(), KEY_SIZE);
//! assert_eq!(split_key(&key), [1, 2, 3, 0]);
//! assert!(make_key([1, 2, 4, 0]) > key);
//! ```

mod node;
mod scan;
mod tree;

pub use node::{
    FLAG_EXPLICIT, FLAG_INFERRED, InternalNode, KEY_SIZE, Key, LeafEntry, LeafNode,
    MAX_INTERNAL_KEYS, MAX_LEAF_ENTRIES, Node, NodeError, NodeHeader, NodeType, make_key,
    split_key,
};
pub use scan::RangeScan;
pub use tree::{
    BTree, BTreeError, MIN_FANOUT, TreeContext, prefix_lower_bound, prefix_upper_bound,
};
