//! Slot-addressed driver over a [`ByteDevice`].
//!
//! A store is an array of fixed-size node slots. Slot 0 holds the
//! [`StoreHeader`]; every other slot holds one serialized tree node. Slots
//! are padded to the configured alignment so direct I/O lands on boundaries
//! the host accepts.

use crate::header::{HEADER_SIZE, StoreHeader};
use crate::{AlignedBuf, ByteDevice, FileByteDevice, IoPath};
use sbd_error::{Result, SbdError};
use sbd_types::{ByteOffset, round_up_u64};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// How to open the backing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, creating the file when the path does not exist.
    CreateReadWrite,
}

/// Fixed-slot store over a byte device.
pub struct AlignedStore {
    device: Arc<dyn ByteDevice>,
    node_size: u32,
    alignment: u32,
    slot_size: u64,
    readonly: bool,
}

impl AlignedStore {
    /// Open a file or raw block device as a slot store.
    pub fn open_file(
        path: impl AsRef<Path>,
        io_path: IoPath,
        node_size: u32,
        alignment: u32,
        mode: OpenMode,
    ) -> Result<Self> {
        let device: Arc<dyn ByteDevice> = match mode {
            OpenMode::ReadOnly => Arc::new(FileByteDevice::open_readonly(path, io_path)?),
            OpenMode::ReadWrite => Arc::new(FileByteDevice::open_rw(path, io_path)?),
            OpenMode::CreateReadWrite => Arc::new(FileByteDevice::open_or_create(path, io_path)?),
        };
        Self::over_device(device, node_size, alignment, mode == OpenMode::ReadOnly)
    }

    /// Layer a slot store over an already-open device.
    pub fn over_device(
        device: Arc<dyn ByteDevice>,
        node_size: u32,
        alignment: u32,
        readonly: bool,
    ) -> Result<Self> {
        if node_size == 0 {
            return Err(SbdError::InvalidParameter(
                "node size must not be zero".to_owned(),
            ));
        }
        let slot_size = round_up_u64(u64::from(node_size), u64::from(alignment));
        Ok(Self {
            device,
            node_size,
            alignment,
            slot_size,
            readonly,
        })
    }

    /// Open just far enough to read a store header, with the direct-io
    /// default geometry, so no catalog entry is needed.
    pub fn open_header_probe(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_file(
            path,
            IoPath::buffered(),
            sbd_types::PHYSICAL_BLOCK_SIZE,
            sbd_types::PHYSICAL_BLOCK_SIZE,
            OpenMode::ReadOnly,
        )
    }

    #[must_use]
    pub fn node_size(&self) -> u32 {
        self.node_size
    }

    #[must_use]
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    #[must_use]
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    fn slot_offset(&self, slot: u32) -> ByteOffset {
        ByteOffset(u64::from(slot) * self.slot_size)
    }

    fn buffer_alignment(&self) -> usize {
        self.alignment.max(1) as usize
    }

    /// Read one full slot, padding included.
    pub fn read_slot(&self, slot: u32) -> Result<Vec<u8>> {
        let mut buf = AlignedBuf::zeroed(self.slot_size as usize, self.buffer_alignment());
        self.device
            .read_exact_at(self.slot_offset(slot), buf.as_mut_slice())?;
        Ok(buf.as_slice().to_vec())
    }

    /// Write `data` into a slot; shorter payloads are zero-padded to the
    /// full slot.
    pub fn write_slot(&self, slot: u32, data: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(SbdError::InvalidParameter(
                "store is open read-only".to_owned(),
            ));
        }
        if data.len() > self.slot_size as usize {
            return Err(SbdError::InvalidParameter(format!(
                "slot payload of {} bytes exceeds slot size {}",
                data.len(),
                self.slot_size
            )));
        }
        let mut buf = AlignedBuf::zeroed(self.slot_size as usize, self.buffer_alignment());
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        self.device.write_all_at(self.slot_offset(slot), buf.as_slice())
    }

    /// Read and magic-check the header in slot 0.
    ///
    /// A device too short to hold a header reports `Uninitialized` rather
    /// than an I/O error, so a brand-new backing file is indistinguishable
    /// from a wiped one.
    pub fn load_header(&self) -> Result<StoreHeader> {
        if self.device.len_bytes() < HEADER_SIZE as u64 {
            return Err(SbdError::Uninitialized);
        }
        let mut buf = AlignedBuf::zeroed(
            (self.slot_size as usize).min(self.device.len_bytes() as usize),
            self.buffer_alignment(),
        );
        self.device
            .read_exact_at(ByteOffset::ZERO, buf.as_mut_slice())?;
        StoreHeader::deserialize_checked(buf.as_slice())
    }

    /// Serialize `header` into slot 0.
    pub fn write_header(&self, header: &StoreHeader) -> Result<()> {
        self.write_slot(0, &header.serialize())
    }

    /// Zero the whole header slot. The store is unreadable afterwards.
    pub fn wipe_header(&self) -> Result<()> {
        debug!(target: "sbd::store", event = "wipe_header", slot_size = self.slot_size);
        self.write_slot(0, &[])?;
        self.device.sync()
    }

    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryByteDevice;
    use crate::header::STORE_MAGIC;

    fn memory_store(node_size: u32, alignment: u32) -> AlignedStore {
        AlignedStore::over_device(
            Arc::new(MemoryByteDevice::new()),
            node_size,
            alignment,
            false,
        )
        .unwrap()
    }

    fn header() -> StoreHeader {
        StoreHeader {
            magic: STORE_MAGIC,
            store_size_in_bytes: 1024 * 1024,
            nodes_per_block: 1,
            block_size: 256,
            block_count: 1,
            root_node: 0,
            free_position: 1,
            alignment: 512,
            dirty: 0,
        }
    }

    #[test]
    fn slot_size_is_padded_to_alignment() {
        let store = memory_store(300, 512);
        assert_eq!(store.slot_size(), 512);
        let unaligned = memory_store(300, 0);
        assert_eq!(unaligned.slot_size(), 300);
    }

    #[test]
    fn header_write_then_load() {
        let store = memory_store(256, 512);
        store.write_header(&header()).unwrap();
        assert_eq!(store.load_header().unwrap(), header());
    }

    #[test]
    fn empty_device_is_uninitialized() {
        let store = memory_store(256, 512);
        assert!(matches!(
            store.load_header().unwrap_err(),
            SbdError::Uninitialized
        ));
    }

    #[test]
    fn wiped_header_is_uninitialized() {
        let store = memory_store(256, 512);
        store.write_header(&header()).unwrap();
        store.wipe_header().unwrap();
        assert!(matches!(
            store.load_header().unwrap_err(),
            SbdError::Uninitialized
        ));
    }

    #[test]
    fn slots_do_not_overlap() {
        let store = memory_store(256, 512);
        store.write_slot(1, &[1_u8; 256]).unwrap();
        store.write_slot(2, &[2_u8; 256]).unwrap();
        assert_eq!(store.read_slot(1).unwrap()[..256], [1_u8; 256]);
        assert_eq!(store.read_slot(2).unwrap()[..256], [2_u8; 256]);
    }

    #[test]
    fn oversized_slot_payload_is_rejected() {
        let store = memory_store(256, 0);
        assert!(store.write_slot(1, &[0_u8; 257]).is_err());
    }

    #[test]
    fn readonly_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        std::fs::write(&path, vec![0_u8; 4096]).unwrap();
        let store =
            AlignedStore::open_file(&path, IoPath::buffered(), 256, 0, OpenMode::ReadOnly)
                .unwrap();
        assert!(store.write_slot(0, &[0_u8; 16]).is_err());
    }
}
