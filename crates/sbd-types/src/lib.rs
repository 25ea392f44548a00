#![forbid(unsafe_code)]
//! Shared constants and types for the sbd workspace.
//!
//! `DeviceSpec` is the declared definition of one virtual block device; it is
//! what the catalog persists and what every other crate consumes.

use sbd_error::{Result, SbdError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sector size the kernel shim presents and the physical alignment unit.
pub const PHYSICAL_BLOCK_SIZE: u32 = 4096;

/// Smallest permitted virtual device size.
pub const ONE_MEG: u64 = 1024 * 1024;

/// Default bytes of user payload in one mother node.
pub const DEFAULT_NODE_VALUE_SIZE: u32 = 64 * 1024;

/// Per-request timeout handed to the kernel at device creation.
pub const KERNEL_TIMEOUT_SECONDS: u32 = 1200;

/// Device nodes appear under this prefix once the kernel attaches them.
pub const DEVICE_PATH_PREFIX: &str = "/dev/";

/// Default control device for the kernel shim.
pub const DEFAULT_CONTROL_DEVICE: &str = "/dev/zosbd2ctl";

/// Byte offset into a backing store (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared parameters for one virtual block device.
///
/// Serialized verbatim into the catalog document; field names are part of the
/// on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Case-preserved; compared case-insensitively across the catalog.
    pub device_name: String,
    /// Virtual device size in bytes.
    pub size: u64,
    /// Absolute path to the file or raw block device backing the store.
    pub storage_file: String,
    /// Bypass the page cache (O_DIRECT) for all backing I/O.
    pub directio: bool,
    /// Make writes durable before acknowledgement (O_SYNC).
    pub sync: bool,
    /// Byte alignment of node slots in the backing store. Zero means
    /// "derive": 4096 under directio, otherwise the calculated node size.
    pub alignment: u32,
    /// Bytes of user payload stored in a mother node.
    pub node_value_size: u32,
    /// On-disk size of one node including its header. Derived by the tree
    /// engine at add time; never supplied by the operator.
    pub node_calculated_size: u32,
    /// Offspring nodes chained after the mother node.
    pub additional_nodes_per_block: u32,
    /// Mount after start, unmount before stop.
    pub mount: bool,
    /// Where to mount; required when `mount` is set.
    pub mountpoint: String,
    /// Skip this entry on `catalog start --all`.
    #[serde(default)]
    pub exclude_from_start_all: bool,
}

impl DeviceSpec {
    /// Largest value one tree entry can hold: the mother node plus all of its
    /// offspring.
    #[must_use]
    pub fn max_entry_bytes(&self) -> u64 {
        u64::from(self.additional_nodes_per_block + 1) * u64::from(self.node_value_size)
    }

    /// Number of kernel-visible blocks the virtual device presents.
    #[must_use]
    pub fn kernel_block_count(&self) -> u64 {
        self.size / u64::from(PHYSICAL_BLOCK_SIZE)
    }

    /// Validate the operator-supplied fields against the declared invariants.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.is_empty() {
            return Err(SbdError::InvalidParameter(
                "device name must not be empty".to_owned(),
            ));
        }
        if self.storage_file.is_empty() {
            return Err(SbdError::InvalidParameter(
                "storage file must not be empty".to_owned(),
            ));
        }
        if self.size % u64::from(PHYSICAL_BLOCK_SIZE) != 0 {
            return Err(SbdError::InvalidParameter(format!(
                "block device size {} is not a multiple of {PHYSICAL_BLOCK_SIZE}",
                self.size
            )));
        }
        if self.size < ONE_MEG {
            return Err(SbdError::InvalidParameter(format!(
                "block device size {} must be at least {ONE_MEG}",
                self.size
            )));
        }
        if self.directio && self.alignment != 0 && self.alignment % PHYSICAL_BLOCK_SIZE != 0 {
            return Err(SbdError::InvalidParameter(format!(
                "alignment {} must fall on a {PHYSICAL_BLOCK_SIZE} boundary when directio is on",
                self.alignment
            )));
        }
        if self.node_value_size == 0 {
            return Err(SbdError::InvalidParameter(
                "node value size must not be zero".to_owned(),
            ));
        }
        if self.mount && self.mountpoint.is_empty() {
            return Err(SbdError::InvalidParameter(
                "a mountpoint is required when mount is set".to_owned(),
            ));
        }
        Ok(())
    }

    /// Path of the kernel device node once attached.
    #[must_use]
    pub fn device_path(&self) -> String {
        format!("{DEVICE_PATH_PREFIX}{}", self.device_name)
    }
}

// ── byte parsing helpers ────────────────────────────────────────────────────

/// Bounds-checked subslice; avoids panicking indexes in deserializers.
#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| SbdError::InvalidParameter("slice range overflow".to_owned()))?;
    if end > data.len() {
        return Err(SbdError::InvalidParameter(format!(
            "insufficient data: need {len} bytes at offset {offset}, have {}",
            data.len().saturating_sub(offset)
        )));
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Round `value` up to the next multiple of `alignment` (alignment 0 is
/// identity).
#[must_use]
pub fn round_up_u64(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Hex dump in the classic offset / bytes / ascii layout, for diagnostics.
#[must_use]
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", row * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!("{b:02x} ")),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push(' ');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}
