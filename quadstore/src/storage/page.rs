//! Fixed-size pages.
//!
//! Every node, free-list link and superblock is one 8KB page. The first
//! eight bytes are a header:
//!
//! | bytes | field                                     |
//! |-------|-------------------------------------------|
//! | 0     | [`PageType`]                              |
//! | 1..4  | reserved, zero                            |
//! | 4..8  | CRC32 of the page with this field zeroed  |
//!
//! Integers are little-endian.

/// Page size in bytes.
pub const PAGE_SIZE: usize = 8192;

pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Page number within the page file. B-tree node ids are page ids.
pub type PageId = u64;

const TYPE_OFFSET: usize = 0;
const CHECKSUM_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Superblock = 0x01,
    BTreeInternal = 0x03,
    BTreeLeaf = 0x04,
    /// Link of the persisted free-page chain.
    FreeList = 0x06,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        [
            Self::Superblock,
            Self::BTreeInternal,
            Self::BTreeLeaf,
            Self::FreeList,
        ]
        .into_iter()
        .find(|t| *t as u8 == value)
        .ok_or(value)
    }
}

/// The decoded page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub checksum: u32,
}

impl PageHeader {
    /// Header length; page payloads start here.
    pub const SIZE: usize = 8;

    pub fn read(page: &Page) -> Result<Self, PageError> {
        Ok(Self {
            page_type: PageType::try_from(page.read_u8(TYPE_OFFSET))
                .map_err(PageError::InvalidPageType)?,
            checksum: page.read_u32(CHECKSUM_OFFSET),
        })
    }
}

/// One page of bytes.
#[derive(Clone)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// A zeroed page. Reading a never-written page yields this.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// A zeroed page with `page_type` in its header.
    #[must_use]
    pub fn with_type(page_type: PageType) -> Self {
        let mut page = Self::new();
        page.write_u8(TYPE_OFFSET, page_type as u8);
        page
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[offset..offset + N]);
        out
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.array(offset))
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.array(offset))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.array(offset))
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.data[CHECKSUM_OFFSET + 4..]);
        hasher.finalize()
    }

    /// Store the checksum in the header. Called right before a write.
    pub fn seal(&mut self) {
        let checksum = self.checksum();
        self.write_u32(CHECKSUM_OFFSET, checksum);
    }

    pub fn verify_checksum(&self) -> Result<(), PageError> {
        let expected = self.read_u32(CHECKSUM_OFFSET);
        let actual = self.checksum();
        if expected != actual {
            return Err(PageError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("header", &&self.data[..PageHeader::SIZE])
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    InvalidPageType(u8),
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "unknown page type 0x{v:02x}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "page checksum is {actual:08x}, header says {expected:08x}"
            ),
        }
    }
}

impl std::error::Error for PageError {}
