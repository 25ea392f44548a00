//! On-disk backing-store header.
//!
//! The header lives in slot 0 of the store. Fixed little-endian layout; the
//! remainder of the slot is zero padding.

use sbd_error::{Result, SbdError};
use sbd_types::{read_le_u32, read_le_u64};
use serde::Serialize;

/// "sbdstree" in ASCII.
pub const STORE_MAGIC: u64 = 0x7362_6473_7472_6565;

/// Serialized header length in bytes.
pub const HEADER_SIZE: usize = 44;

/// Backing-store header fields, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreHeader {
    pub magic: u64,
    /// Declared capacity of the store in bytes.
    pub store_size_in_bytes: u64,
    /// Mother plus offspring nodes per tree entry.
    pub nodes_per_block: u32,
    /// Calculated node size (one slot's payload, before alignment padding).
    pub block_size: u32,
    /// Node slots the store may use, including the header slot.
    pub block_count: u32,
    /// Slot index of the tree root; zero when the tree is empty.
    pub root_node: u32,
    /// Next never-allocated slot.
    pub free_position: u32,
    /// Slot alignment in bytes.
    pub alignment: u32,
    /// Nonzero while the store is open for writing.
    pub dirty: u32,
}

impl StoreHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.store_size_in_bytes.to_le_bytes());
        out.extend_from_slice(&self.nodes_per_block.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.block_count.to_le_bytes());
        out.extend_from_slice(&self.root_node.to_le_bytes());
        out.extend_from_slice(&self.free_position.to_le_bytes());
        out.extend_from_slice(&self.alignment.to_le_bytes());
        out.extend_from_slice(&self.dirty.to_le_bytes());
        debug_assert_eq!(out.len(), HEADER_SIZE);
        out
    }

    /// Deserialize without judging the magic; callers decide how a bad magic
    /// is reported.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(Self {
            magic: read_le_u64(data, 0)?,
            store_size_in_bytes: read_le_u64(data, 8)?,
            nodes_per_block: read_le_u32(data, 16)?,
            block_size: read_le_u32(data, 20)?,
            block_count: read_le_u32(data, 24)?,
            root_node: read_le_u32(data, 28)?,
            free_position: read_le_u32(data, 32)?,
            alignment: read_le_u32(data, 36)?,
            dirty: read_le_u32(data, 40)?,
        })
    }

    /// Deserialize and require a valid magic.
    pub fn deserialize_checked(data: &[u8]) -> Result<Self> {
        let header = Self::deserialize(data)?;
        if header.magic != STORE_MAGIC {
            return Err(SbdError::Uninitialized);
        }
        Ok(header)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }
}
