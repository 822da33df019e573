//! On-page layout of B-tree nodes.
//!
//! Every node occupies one 8KB page:
//! - Internal nodes: keys and child node ids
//! - Leaf nodes: keys and a one-byte flag value
//!
//! There are no parent or sibling pointers. Copy-on-write moves nodes to new
//! pages, so any stored pointer other than the parent's child slot would go
//! stale.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageId, PageType};

/// Size of a key in bytes (four term ids of 8 bytes).
pub const KEY_SIZE: usize = 32;

/// A 32-byte key: four big-endian term ids in permutation order.
pub type Key = [u8; KEY_SIZE];

/// Leaf value flag for an explicitly added statement.
pub const FLAG_EXPLICIT: u8 = 0x01;

/// Leaf value flag for an inferred statement.
pub const FLAG_INFERRED: u8 = 0x00;

/// Node header layout (after page header):
/// - `node_type`: 1 byte (0 = internal, 1 = leaf)
/// - reserved: 1 byte
/// - `key_count`: 2 bytes
/// - reserved: 4 bytes
/// - `node_id`: 8 bytes
///
/// Total: 16 bytes
const NODE_HEADER_SIZE: usize = 16;

/// First payload byte.
const DATA_OFFSET: usize = PageHeader::SIZE + NODE_HEADER_SIZE;

/// Payload bytes per node.
const DATA_SPACE: usize = PAGE_SIZE - DATA_OFFSET;

/// Internal node entry size: key (32 bytes) + child pointer (8 bytes).
const INTERNAL_ENTRY_SIZE: usize = KEY_SIZE + 8;

/// Maximum number of keys in an internal node.
/// `DATA_SPACE` = N * `KEY_SIZE` + (N+1) * 8
pub const MAX_INTERNAL_KEYS: usize = (DATA_SPACE - 8) / INTERNAL_ENTRY_SIZE;

/// Leaf entry size: key (32 bytes) + flag (1 byte).
const LEAF_ENTRY_SIZE: usize = KEY_SIZE + 1;

/// Maximum number of entries in a leaf node.
pub const MAX_LEAF_ENTRIES: usize = DATA_SPACE / LEAF_ENTRY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Internal = 0,
    Leaf = 1,
}

impl TryFrom<u8> for NodeType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Internal),
            1 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// Header information for a B-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub node_type: NodeType,
    pub key_count: u16,
    pub node_id: PageId,
}

impl NodeHeader {
    #[must_use]
    pub fn from_page(page: &Page) -> Option<Self> {
        let offset = PageHeader::SIZE;
        let node_type = NodeType::try_from(page.read_u8(offset)).ok()?;
        let key_count = page.read_u16(offset + 2);
        let node_id = page.read_u64(offset + 8);

        Some(Self {
            node_type,
            key_count,
            node_id,
        })
    }

    pub fn write_to_page(&self, page: &mut Page) {
        let offset = PageHeader::SIZE;
        page.write_u8(offset, self.node_type as u8);
        page.write_u16(offset + 2, self.key_count);
        page.write_u64(offset + 8, self.node_id);
    }
}

/// An internal (non-leaf) B-tree node.
///
/// Stores N keys and N+1 child pointers.
/// `Child[i]` contains keys < `Key[i]`
/// `Child[i+1]` contains keys >= `Key[i]`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalNode {
    /// Keys in sorted order.
    pub keys: Vec<Key>,
    /// Child node ids. `children.len()` == `keys.len()` + 1
    pub children: Vec<PageId>,
}

impl InternalNode {
    /// Create an internal node with two children, used when the root splits.
    #[must_use]
    pub fn with_children(left_child: PageId, key: Key, right_child: PageId) -> Self {
        Self {
            keys: vec![key],
            children: vec![left_child, right_child],
        }
    }

    fn read(page: &Page, key_count: usize) -> Result<Self, NodeError> {
        if key_count > MAX_INTERNAL_KEYS {
            return Err(NodeError::TooManyKeys(key_count));
        }

        let mut keys = Vec::with_capacity(key_count);
        let mut children = Vec::with_capacity(key_count + 1);

        let mut offset = DATA_OFFSET;
        children.push(page.read_u64(offset));
        offset += 8;

        for _ in 0..key_count {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(page.read_bytes(offset, KEY_SIZE));
            keys.push(key);
            offset += KEY_SIZE;

            children.push(page.read_u64(offset));
            offset += 8;
        }

        Ok(Self { keys, children })
    }

    fn write(&self, page: &mut Page) {
        let mut offset = DATA_OFFSET;
        if let Some(&first) = self.children.first() {
            page.write_u64(offset, first);
        }
        offset += 8;

        for (key, &child) in self.keys.iter().zip(self.children.iter().skip(1)) {
            page.write_bytes(offset, key);
            offset += KEY_SIZE;
            page.write_u64(offset, child);
            offset += 8;
        }
    }

    /// Index of the child whose range holds `key`.
    #[must_use]
    pub fn find_child_index(&self, key: &Key) -> usize {
        match self.keys.binary_search(key) {
            Ok(i) => i + 1, // Exact match, go right
            Err(i) => i,
        }
    }

    /// Move the upper half into a new right sibling. Returns the median,
    /// which moves up into the parent and stays in neither half.
    #[must_use]
    pub fn split(&mut self) -> (Key, Self) {
        let mid = self.keys.len() / 2;
        let right_keys: Vec<Key> = self.keys.drain(mid + 1..).collect();
        let right_children: Vec<PageId> = self.children.drain(mid + 1..).collect();
        let median_key = self.keys.pop().unwrap_or([0u8; KEY_SIZE]);

        (
            median_key,
            Self {
                keys: right_keys,
                children: right_children,
            },
        )
    }
}

/// A key-flag entry in a leaf node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Key,
    pub value: u8,
}

/// A leaf B-tree node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafNode {
    /// Sorted by key.
    pub entries: Vec<LeafEntry>,
}

impl LeafNode {
    fn read(page: &Page, entry_count: usize) -> Result<Self, NodeError> {
        if entry_count > MAX_LEAF_ENTRIES {
            return Err(NodeError::TooManyKeys(entry_count));
        }

        let mut entries = Vec::with_capacity(entry_count);
        let mut offset = DATA_OFFSET;
        for _ in 0..entry_count {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(page.read_bytes(offset, KEY_SIZE));
            offset += KEY_SIZE;
            let value = page.read_u8(offset);
            offset += 1;
            entries.push(LeafEntry { key, value });
        }

        Ok(Self { entries })
    }

    fn write(&self, page: &mut Page) {
        let mut offset = DATA_OFFSET;
        for entry in &self.entries {
            page.write_bytes(offset, &entry.key);
            offset += KEY_SIZE;
            page.write_u8(offset, entry.value);
            offset += 1;
        }
    }

    /// `Ok` with the position of `key`, or `Err` with where it would go.
    pub fn find_index(&self, key: &Key) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(key))
    }

    /// Get a value by key.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<u8> {
        self.find_index(key).ok().map(|i| self.entries[i].value)
    }

    /// Move the upper half into a new right sibling. Returns its first key.
    #[must_use]
    pub fn split(&mut self) -> (Key, Self) {
        let mid = self.entries.len() / 2;
        let right_entries: Vec<LeafEntry> = self.entries.drain(mid..).collect();
        let split_key = right_entries.first().map_or([0u8; KEY_SIZE], |e| e.key);

        (
            split_key,
            Self {
                entries: right_entries,
            },
        )
    }
}

/// A decoded B-tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl Node {
    /// Number of keys (internal) or entries (leaf).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Internal(node) => node.keys.len(),
            Self::Leaf(node) => node.entries.len(),
        }
    }

    /// True for a node without keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn node_type(&self) -> NodeType {
        match self {
            Self::Internal(_) => NodeType::Internal,
            Self::Leaf(_) => NodeType::Leaf,
        }
    }

    /// Decode a node stored on page `node_id`.
    ///
    /// The page checksum must already have been verified.
    pub fn from_page(page: &Page, node_id: PageId) -> Result<Self, NodeError> {
        let header = NodeHeader::from_page(page).ok_or(NodeError::InvalidHeader)?;
        if header.node_id != node_id {
            return Err(NodeError::IdMismatch {
                expected: node_id,
                found: header.node_id,
            });
        }

        let page_type = PageHeader::read(page)
            .map_err(|_| NodeError::InvalidHeader)?
            .page_type;
        let key_count = header.key_count as usize;
        match (header.node_type, page_type) {
            (NodeType::Internal, PageType::BTreeInternal) => {
                InternalNode::read(page, key_count).map(Self::Internal)
            }
            (NodeType::Leaf, PageType::BTreeLeaf) => LeafNode::read(page, key_count).map(Self::Leaf),
            _ => Err(NodeError::WrongNodeType),
        }
    }

    /// Encode the node for page `node_id`. The page still has to be sealed.
    #[must_use]
    pub fn to_page(&self, node_id: PageId) -> Page {
        let page_type = match self {
            Self::Internal(_) => PageType::BTreeInternal,
            Self::Leaf(_) => PageType::BTreeLeaf,
        };
        let mut page = Page::with_type(page_type);
        NodeHeader {
            node_type: self.node_type(),
            key_count: self.len() as u16,
            node_id,
        }
        .write_to_page(&mut page);

        match self {
            Self::Internal(node) => node.write(&mut page),
            Self::Leaf(node) => node.write(&mut page),
        }
        page
    }
}

/// A page that does not hold a well-formed node.
#[derive(Debug)]
pub enum NodeError {
    /// Invalid node header.
    InvalidHeader,
    /// Wrong node type for the page type.
    WrongNodeType,
    /// More keys than fit in a page.
    TooManyKeys(usize),
    /// The page holds a node written for another page.
    IdMismatch { expected: PageId, found: PageId },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHeader => write!(f, "invalid node header"),
            Self::WrongNodeType => write!(f, "node type does not match page type"),
            Self::TooManyKeys(n) => write!(f, "node claims {n} keys"),
            Self::IdMismatch { expected, found } => {
                write!(f, "page {expected} holds node {found}")
            }
        }
    }
}

impl std::error::Error for NodeError {}

/// Create a key from four term ids in permutation order.
#[must_use]
pub fn make_key(ids: [u64; 4]) -> Key {
    let mut key = [0u8; KEY_SIZE];
    for (chunk, id) in key.chunks_exact_mut(8).zip(ids) {
        chunk.copy_from_slice(&id.to_be_bytes());
    }
    key
}

/// Extract the four term ids from a key.
#[must_use]
pub fn split_key(key: &Key) -> [u64; 4] {
    let mut ids = [0u64; 4];
    for (id, chunk) in ids.iter_mut().zip(key.chunks_exact(8)) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        *id = u64::from_be_bytes(bytes);
    }
    ids
}
