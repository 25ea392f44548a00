//! The STree engine facade consumed by the lifecycle controller.
//!
//! Entries are keyed records whose value spans one mother node and up to
//! `additional_nodes_per_block` offspring nodes. Nodes live in store slots
//! and link into a binary search tree rooted at the header's root pointer.
//! The controller only ever sees the lifecycle surface (`is_initialized`,
//! `init`, `startup`, `shutdown`, `wipe`, `dispose`) and value-sized
//! `read_entry`/`write_entry`.

use crate::header::{STORE_MAGIC, StoreHeader};
use crate::store::{AlignedStore, OpenMode};
use crate::{ByteDevice, IoPath, MemoryByteDevice};
use sbd_error::{Result, SbdError};
use sbd_types::{DeviceSpec, PHYSICAL_BLOCK_SIZE, ensure_slice, read_le_u32};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed length of every tree key: a zero-padded hex rendering of the entry
/// index.
pub const KEY_LENGTH: u32 = 16;

/// parent + left + right + key_len + value_len, each u32.
const NODE_FIXED_HEADER: u32 = 20;

/// Canonical on-disk size of one node record for the given sizing inputs.
///
/// This is the engine's sizing function; the catalog persists its result and
/// every later load must recompute the same number.
pub fn calculate_node_size(
    key_length: u32,
    value_length: u32,
    additional_nodes_per_block: u32,
) -> Result<u32> {
    if value_length == 0 {
        return Err(SbdError::InvalidParameter(
            "node value size must not be zero".to_owned(),
        ));
    }
    Ok(NODE_FIXED_HEADER + key_length + 4 * additional_nodes_per_block + value_length)
}

/// Normalize a declared alignment against the direct-io rules.
///
/// Zero means "derive": 4096 under direct I/O, otherwise the calculated node
/// size so slots pack back to back with zero waste.
pub fn resolve_alignment(directio: bool, alignment: u32, node_size: u32) -> Result<u32> {
    if directio {
        let alignment = if alignment == 0 {
            PHYSICAL_BLOCK_SIZE
        } else {
            alignment
        };
        if alignment % PHYSICAL_BLOCK_SIZE != 0 {
            return Err(SbdError::InvalidParameter(format!(
                "alignment {alignment} must fall on a {PHYSICAL_BLOCK_SIZE} boundary when directio is on"
            )));
        }
        Ok(alignment)
    } else if alignment == 0 {
        Ok(node_size)
    } else {
        Ok(alignment)
    }
}

/// One deserialized node record.
///
/// Offspring slots reuse the same record layout with an empty key; their
/// `value_len` counts only the bytes stored in that node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub parent: u32,
    pub left: u32,
    pub right: u32,
    pub key: Vec<u8>,
    pub value_len: u32,
    pub offspring: Vec<u32>,
    pub value: Vec<u8>,
}

impl NodeRecord {
    fn empty(additional: u32) -> Self {
        Self {
            parent: 0,
            left: 0,
            right: 0,
            key: Vec::new(),
            value_len: 0,
            offspring: vec![0; additional as usize],
            value: Vec::new(),
        }
    }

    /// Byte length of the header portion (everything before the value area).
    #[must_use]
    pub fn header_len(key_length: u32, additional: u32) -> usize {
        (NODE_FIXED_HEADER + key_length + 4 * additional) as usize
    }

    /// Parse a raw slot as a node record.
    pub fn parse(data: &[u8], key_length: u32, value_length: u32, additional: u32) -> Result<Self> {
        let parent = read_le_u32(data, 0)?;
        let left = read_le_u32(data, 4)?;
        let right = read_le_u32(data, 8)?;
        let key_len = read_le_u32(data, 12)?;
        let value_len = read_le_u32(data, 16)?;
        if key_len > key_length {
            return Err(SbdError::InvalidParameter(format!(
                "node key length {key_len} exceeds store key length {key_length}"
            )));
        }
        let key = ensure_slice(data, 20, key_len as usize)?.to_vec();
        let mut offspring = Vec::with_capacity(additional as usize);
        let offspring_base = (NODE_FIXED_HEADER + key_length) as usize;
        for i in 0..additional as usize {
            offspring.push(read_le_u32(data, offspring_base + 4 * i)?);
        }
        let value_base = Self::header_len(key_length, additional);
        let stored = (value_len as usize).min(value_length as usize);
        let value = ensure_slice(data, value_base, stored)?.to_vec();
        Ok(Self {
            parent,
            left,
            right,
            key,
            value_len,
            offspring,
            value,
        })
    }

    fn serialize(&self, key_length: u32, value_length: u32, additional: u32) -> Vec<u8> {
        let node_size = (NODE_FIXED_HEADER + key_length + 4 * additional + value_length) as usize;
        let mut out = vec![0_u8; node_size];
        out[0..4].copy_from_slice(&self.parent.to_le_bytes());
        out[4..8].copy_from_slice(&self.left.to_le_bytes());
        out[8..12].copy_from_slice(&self.right.to_le_bytes());
        out[12..16].copy_from_slice(&(self.key.len() as u32).to_le_bytes());
        out[16..20].copy_from_slice(&self.value_len.to_le_bytes());
        out[20..20 + self.key.len()].copy_from_slice(&self.key);
        let offspring_base = (NODE_FIXED_HEADER + key_length) as usize;
        for (i, slot) in self.offspring.iter().enumerate() {
            out[offspring_base + 4 * i..offspring_base + 4 * i + 4]
                .copy_from_slice(&slot.to_le_bytes());
        }
        let value_base = Self::header_len(key_length, additional);
        out[value_base..value_base + self.value.len()].copy_from_slice(&self.value);
        out
    }
}

/// What medium backs the store.
#[derive(Debug)]
pub enum StreeBacking {
    File { path: PathBuf, io_path: IoPath },
    /// In-memory store for the stree-ramdisk test mode.
    Memory,
}

/// The tree engine handle the controller binds to one device definition.
pub struct Stree {
    backing: StreeBacking,
    value_length: u32,
    additional_nodes: u32,
    node_size: u32,
    alignment: u32,
    store_size: u64,
    store: Option<AlignedStore>,
    header: Option<StoreHeader>,
    memory: Option<Arc<MemoryByteDevice>>,
}

impl std::fmt::Debug for Stree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stree")
            .field("backing", &self.backing)
            .field("value_length", &self.value_length)
            .field("additional_nodes", &self.additional_nodes)
            .field("node_size", &self.node_size)
            .field("alignment", &self.alignment)
            .field("store_size", &self.store_size)
            .field("store", &self.store.is_some())
            .field("header", &self.header)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

impl Stree {
    /// Bind an engine handle to a device definition.
    ///
    /// Computes the canonical node size, hard-fails when a previously stored
    /// `node_calculated_size` disagrees with it, and writes both the
    /// calculated size and the normalized alignment back into `spec`.
    pub fn from_spec(spec: &mut DeviceSpec, backing: StreeBacking) -> Result<Self> {
        let node_size = calculate_node_size(
            KEY_LENGTH,
            spec.node_value_size,
            spec.additional_nodes_per_block,
        )?;
        if spec.node_calculated_size != 0 && spec.node_calculated_size != node_size {
            return Err(SbdError::SanityFailure(format!(
                "node calculated size is already set to {} but the engine computes {node_size}",
                spec.node_calculated_size
            )));
        }
        spec.node_calculated_size = node_size;

        let alignment = resolve_alignment(spec.directio, spec.alignment, node_size)?;
        spec.alignment = alignment;

        let memory = match backing {
            StreeBacking::Memory => Some(Arc::new(MemoryByteDevice::new())),
            StreeBacking::File { .. } => None,
        };
        Ok(Self {
            backing,
            value_length: spec.node_value_size,
            additional_nodes: spec.additional_nodes_per_block,
            node_size,
            alignment,
            store_size: spec.size,
            store: None,
            header: None,
            memory,
        })
    }

    #[must_use]
    pub fn node_size(&self) -> u32 {
        self.node_size
    }

    #[must_use]
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Largest value one entry can hold across the mother and its offspring.
    #[must_use]
    pub fn max_entry_bytes(&self) -> u64 {
        u64::from(self.additional_nodes + 1) * u64::from(self.value_length)
    }

    fn open_store(&self, mode: OpenMode) -> Result<AlignedStore> {
        match &self.backing {
            StreeBacking::File { path, io_path } => {
                AlignedStore::open_file(path, *io_path, self.node_size, self.alignment, mode)
            }
            StreeBacking::Memory => {
                let device: Arc<dyn ByteDevice> = self
                    .memory
                    .clone()
                    .ok_or_else(|| SbdError::SanityFailure("memory backing lost".to_owned()))?;
                AlignedStore::over_device(
                    device,
                    self.node_size,
                    self.alignment,
                    mode == OpenMode::ReadOnly,
                )
            }
        }
    }

    /// Whether the backing store carries a valid header.
    ///
    /// A missing backing file surfaces as the host's not-found error; the
    /// caller decides whether that means "uninitialized".
    pub fn is_initialized(&self) -> Result<bool> {
        let store = self.open_store(OpenMode::ReadOnly)?;
        match store.load_header() {
            Ok(_) => Ok(true),
            Err(SbdError::Uninitialized) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create the on-disk layout on a store that holds no data yet.
    pub fn init(&mut self) -> Result<()> {
        let store = self.open_store(OpenMode::CreateReadWrite)?;
        let header = StoreHeader {
            magic: STORE_MAGIC,
            store_size_in_bytes: self.store_size,
            nodes_per_block: self.additional_nodes + 1,
            block_size: self.node_size,
            block_count: 1,
            root_node: 0,
            free_position: 1,
            alignment: self.alignment,
            dirty: 0,
        };
        store.write_header(&header)?;
        store.sync()?;
        info!(
            target: "sbd::stree",
            event = "init",
            node_size = self.node_size,
            alignment = self.alignment,
            store_size = self.store_size
        );
        self.header = Some(header);
        self.store = Some(store);
        Ok(())
    }

    /// Open an initialized store for service.
    ///
    /// Refuses a store left dirty by an unclean shutdown unless `force` is
    /// set; marks the store dirty for the duration of the session.
    pub fn startup(&mut self, force: bool) -> Result<()> {
        let store = self.open_store(OpenMode::ReadWrite)?;
        let mut header = store.load_header()?;
        if header.block_size != self.node_size {
            return Err(SbdError::SanityFailure(format!(
                "store header block size {} does not match the calculated node size {}",
                header.block_size, self.node_size
            )));
        }
        if header.is_dirty() && !force {
            return Err(SbdError::InvalidParameter(
                "backing store was not cleanly shut down; start with force to override".to_owned(),
            ));
        }
        header.dirty = 1;
        store.write_header(&header)?;
        store.sync()?;
        debug!(target: "sbd::stree", event = "startup", force = force);
        self.header = Some(header);
        self.store = Some(store);
        Ok(())
    }

    /// Persist the header clean and release the backing store.
    ///
    /// Calling this on an already-shut-down handle is a quiet no-op.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(store) = self.store.take() else {
            return Ok(());
        };
        if let Some(mut header) = self.header {
            header.dirty = 0;
            store.write_header(&header)?;
            self.header = Some(header);
        }
        store.sync()?;
        debug!(target: "sbd::stree", event = "shutdown");
        Ok(())
    }

    /// Destroy the store's identity by zeroing its header slot.
    ///
    /// Requires a started handle. After a wipe the handle can only be shut
    /// down or disposed.
    pub fn wipe(&mut self) -> Result<()> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| SbdError::SanityFailure("wipe on a store that is not open".to_owned()))?;
        store.wipe_header()?;
        // the header must not be rewritten by a later shutdown
        self.header = None;
        info!(target: "sbd::stree", event = "wipe");
        Ok(())
    }

    /// Shut down and release the handle, closing the backing file.
    pub fn dispose(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Flush the backing device without touching the header.
    pub fn sync(&self) -> Result<()> {
        self.store()?.sync()
    }

    fn store(&self) -> Result<&AlignedStore> {
        self.store
            .as_ref()
            .ok_or(SbdError::Uninitialized)
    }

    fn header_mut(&mut self) -> Result<&mut StoreHeader> {
        self.header.as_mut().ok_or(SbdError::Uninitialized)
    }

    fn make_key(entry: u64) -> Vec<u8> {
        format!("{entry:016x}").into_bytes()
    }

    fn read_node(&self, slot: u32) -> Result<NodeRecord> {
        let data = self.store()?.read_slot(slot)?;
        NodeRecord::parse(&data, KEY_LENGTH, self.value_length, self.additional_nodes)
    }

    fn write_node(&self, slot: u32, node: &NodeRecord) -> Result<()> {
        let data = node.serialize(KEY_LENGTH, self.value_length, self.additional_nodes);
        self.store()?.write_slot(slot, &data)
    }

    /// Locate the slot holding `key`, or the slot that would be its parent.
    fn find_slot(&self, key: &[u8]) -> Result<FindResult> {
        let root = self.header.as_ref().ok_or(SbdError::Uninitialized)?.root_node;
        if root == 0 {
            return Ok(FindResult::EmptyTree);
        }
        let mut slot = root;
        loop {
            let node = self.read_node(slot)?;
            match key.cmp(&node.key) {
                Ordering::Equal => return Ok(FindResult::Found { slot, node }),
                Ordering::Less => {
                    if node.left == 0 {
                        return Ok(FindResult::Missing {
                            parent: slot,
                            go_left: true,
                        });
                    }
                    slot = node.left;
                }
                Ordering::Greater => {
                    if node.right == 0 {
                        return Ok(FindResult::Missing {
                            parent: slot,
                            go_left: false,
                        });
                    }
                    slot = node.right;
                }
            }
        }
    }

    fn allocate_slot(&mut self) -> Result<u32> {
        let header = self.header_mut()?;
        let slot = header.free_position;
        header.free_position = header
            .free_position
            .checked_add(1)
            .ok_or_else(|| SbdError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC)))?;
        header.block_count = header.block_count.max(header.free_position);
        Ok(slot)
    }

    /// Read the value stored under `entry`, or `None` when the key was never
    /// written.
    pub fn read_entry(&mut self, entry: u64) -> Result<Option<Vec<u8>>> {
        let key = Self::make_key(entry);
        let FindResult::Found { node, .. } = self.find_slot(&key)? else {
            return Ok(None);
        };
        let mut value = node.value;
        for offspring_slot in &node.offspring {
            if *offspring_slot == 0 {
                break;
            }
            let offspring = self.read_node(*offspring_slot)?;
            value.extend_from_slice(&offspring.value);
        }
        Ok(Some(value))
    }

    /// Store `data` under `entry`, creating or updating the node chain.
    pub fn write_entry(&mut self, entry: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() as u64 > self.max_entry_bytes() {
            return Err(SbdError::InvalidParameter(format!(
                "entry payload of {} bytes is outside 1..={}",
                data.len(),
                self.max_entry_bytes()
            )));
        }
        let key = Self::make_key(entry);
        let value_length = self.value_length as usize;
        let mut chunks = data.chunks(value_length);
        let mother_value = chunks.next().unwrap_or(&[]).to_vec();
        let tail: Vec<&[u8]> = chunks.collect();

        let (slot, mut node) = match self.find_slot(&key)? {
            FindResult::Found { slot, node } => (slot, node),
            FindResult::EmptyTree => {
                let slot = self.allocate_slot()?;
                self.header_mut()?.root_node = slot;
                let mut node = NodeRecord::empty(self.additional_nodes);
                node.key = key;
                (slot, node)
            }
            FindResult::Missing { parent, go_left } => {
                let slot = self.allocate_slot()?;
                let mut parent_node = self.read_node(parent)?;
                if go_left {
                    parent_node.left = slot;
                } else {
                    parent_node.right = slot;
                }
                self.write_node(parent, &parent_node)?;
                let mut node = NodeRecord::empty(self.additional_nodes);
                node.key = key;
                node.parent = parent;
                (slot, node)
            }
        };

        // offspring chain: reuse what is already allocated, extend as needed
        for (i, chunk) in tail.iter().enumerate() {
            let offspring_slot = if node.offspring[i] != 0 {
                node.offspring[i]
            } else {
                let fresh = self.allocate_slot()?;
                node.offspring[i] = fresh;
                fresh
            };
            let mut offspring = NodeRecord::empty(self.additional_nodes);
            offspring.parent = slot;
            offspring.value_len = chunk.len() as u32;
            offspring.value = chunk.to_vec();
            self.write_node(offspring_slot, &offspring)?;
        }
        // retired offspring keep their slots but drop out of the chain
        for i in tail.len()..node.offspring.len() {
            node.offspring[i] = 0;
        }

        node.value_len = mother_value.len() as u32;
        node.value = mother_value;
        self.write_node(slot, &node)?;
        Ok(())
    }
}

enum FindResult {
    EmptyTree,
    Found { slot: u32, node: NodeRecord },
    Missing { parent: u32, go_left: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbd_types::{DEFAULT_NODE_VALUE_SIZE, ONE_MEG};

    fn spec(value_size: u32, additional: u32) -> DeviceSpec {
        DeviceSpec {
            device_name: "t1".to_owned(),
            size: ONE_MEG,
            storage_file: String::new(),
            directio: false,
            sync: false,
            alignment: 0,
            node_value_size: value_size,
            node_calculated_size: 0,
            additional_nodes_per_block: additional,
            mount: false,
            mountpoint: String::new(),
            exclude_from_start_all: false,
        }
    }

    fn memory_stree(value_size: u32, additional: u32) -> (Stree, DeviceSpec) {
        let mut spec = spec(value_size, additional);
        let stree = Stree::from_spec(&mut spec, StreeBacking::Memory).unwrap();
        (stree, spec)
    }

    #[test]
    fn node_size_is_header_plus_key_plus_offspring_plus_value() {
        assert_eq!(calculate_node_size(16, 4096, 0).unwrap(), 20 + 16 + 4096);
        assert_eq!(
            calculate_node_size(16, 4096, 3).unwrap(),
            20 + 16 + 12 + 4096
        );
        assert!(calculate_node_size(16, 0, 0).is_err());
    }

    #[test]
    fn alignment_resolution_follows_directio_rules() {
        assert_eq!(resolve_alignment(true, 0, 500).unwrap(), 4096);
        assert_eq!(resolve_alignment(true, 8192, 500).unwrap(), 8192);
        assert!(resolve_alignment(true, 1234, 500).is_err());
        assert_eq!(resolve_alignment(false, 0, 500).unwrap(), 500);
        assert_eq!(resolve_alignment(false, 600, 500).unwrap(), 600);
    }

    #[test]
    fn from_spec_populates_derived_fields() {
        let (stree, spec) = memory_stree(DEFAULT_NODE_VALUE_SIZE, 2);
        assert_eq!(spec.node_calculated_size, stree.node_size());
        assert_eq!(spec.alignment, stree.node_size());
    }

    #[test]
    fn from_spec_defaults_directio_alignment() {
        let mut s = spec(4096, 0);
        s.directio = true;
        let stree = Stree::from_spec(&mut s, StreeBacking::Memory).unwrap();
        assert_eq!(s.alignment, 4096);
        assert_eq!(stree.alignment(), 4096);
    }

    #[test]
    fn from_spec_detects_sanity_mismatch() {
        let mut s = spec(4096, 0);
        s.node_calculated_size = 999;
        let err = Stree::from_spec(&mut s, StreeBacking::Memory).unwrap_err();
        assert!(matches!(err, SbdError::SanityFailure(_)));
    }

    #[test]
    fn init_then_startup_then_shutdown() {
        let (mut stree, _) = memory_stree(512, 0);
        assert!(!stree.is_initialized().unwrap());
        stree.init().unwrap();
        stree.shutdown().unwrap();
        assert!(stree.is_initialized().unwrap());
        stree.startup(false).unwrap();
        stree.shutdown().unwrap();
        // quiet second shutdown
        stree.shutdown().unwrap();
    }

    #[test]
    fn dirty_store_requires_force() {
        let (mut stree, _) = memory_stree(512, 0);
        stree.init().unwrap();
        stree.startup(false).unwrap();
        // simulate a crash: drop the open store without shutdown
        stree.store = None;
        stree.header = None;

        assert!(stree.startup(false).is_err());
        stree.startup(true).unwrap();
        stree.shutdown().unwrap();
    }

    #[test]
    fn wipe_leaves_store_uninitialized() {
        let (mut stree, _) = memory_stree(512, 0);
        stree.init().unwrap();
        stree.startup(true).unwrap();
        stree.wipe().unwrap();
        stree.shutdown().unwrap();
        assert!(!stree.is_initialized().unwrap());
    }

    #[test]
    fn entries_roundtrip_through_the_tree() {
        let (mut stree, _) = memory_stree(512, 0);
        stree.init().unwrap();
        for entry in [5_u64, 1, 9, 3, 7] {
            let payload = vec![entry as u8; 512];
            stree.write_entry(entry, &payload).unwrap();
        }
        for entry in [1_u64, 3, 5, 7, 9] {
            let value = stree.read_entry(entry).unwrap().unwrap();
            assert_eq!(value, vec![entry as u8; 512]);
        }
        assert!(stree.read_entry(42).unwrap().is_none());
        stree.shutdown().unwrap();
    }

    #[test]
    fn overwrite_replaces_value_in_place() {
        let (mut stree, _) = memory_stree(512, 0);
        stree.init().unwrap();
        stree.write_entry(1, &[0xAA_u8; 512]).unwrap();
        stree.write_entry(1, &[0xBB_u8; 100]).unwrap();
        assert_eq!(stree.read_entry(1).unwrap().unwrap(), vec![0xBB_u8; 100]);
        stree.shutdown().unwrap();
    }

    #[test]
    fn large_values_span_offspring_nodes() {
        let (mut stree, _) = memory_stree(512, 3);
        stree.init().unwrap();
        assert_eq!(stree.max_entry_bytes(), 4 * 512);

        let payload: Vec<u8> = (0..2048_u32).map(|i| (i % 251) as u8).collect();
        stree.write_entry(0, &payload).unwrap();
        assert_eq!(stree.read_entry(0).unwrap().unwrap(), payload);

        // shrink back to a single node
        stree.write_entry(0, &[1_u8; 17]).unwrap();
        assert_eq!(stree.read_entry(0).unwrap().unwrap(), vec![1_u8; 17]);

        let oversized = vec![0_u8; 4 * 512 + 1];
        assert!(stree.write_entry(0, &oversized).is_err());
        stree.shutdown().unwrap();
    }

    #[test]
    fn file_backed_stree_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.bin");
        let mut s = spec(512, 1);
        s.storage_file = path.display().to_string();

        let mut stree = Stree::from_spec(
            &mut s,
            StreeBacking::File {
                path: path.clone(),
                io_path: IoPath::buffered(),
            },
        )
        .unwrap();
        stree.init().unwrap();
        stree.write_entry(3, &[9_u8; 700]).unwrap();
        stree.shutdown().unwrap();

        let mut reopened = Stree::from_spec(
            &mut s,
            StreeBacking::File {
                path,
                io_path: IoPath::buffered(),
            },
        )
        .unwrap();
        reopened.startup(false).unwrap();
        assert_eq!(reopened.read_entry(3).unwrap().unwrap(), vec![9_u8; 700]);
        reopened.dispose().unwrap();
    }
}
