#![forbid(unsafe_code)]
//! Backing-store driver and tree engine for sbd.
//!
//! The driver side ([`ByteDevice`], [`AlignedStore`]) reads and writes
//! fixed-size aligned node slots against a file, raw block device, or memory
//! buffer. The engine side ([`stree::Stree`]) layers the keyed tree store on
//! top and owns the on-disk header lifecycle (init, startup, shutdown, wipe).

pub mod header;
pub mod store;
pub mod stree;

pub use header::StoreHeader;
pub use store::AlignedStore;
pub use stree::{Stree, StreeBacking, calculate_node_size, resolve_alignment};

use parking_lot::Mutex;
use sbd_error::{Result, SbdError};
use sbd_types::ByteOffset;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
///
/// Writes past the current end grow the device where the medium allows it
/// (regular files, memory); raw block devices surface the host error instead.
pub trait ByteDevice: Send + Sync {
    /// Current length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// How a [`FileByteDevice`] opens its backing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPath {
    /// Bypass the page cache (O_DIRECT).
    pub directio: bool,
    /// Durable writes (O_SYNC).
    pub sync: bool,
}

impl IoPath {
    #[must_use]
    pub fn buffered() -> Self {
        Self {
            directio: false,
            sync: false,
        }
    }
}

/// Owned byte buffer whose exposed slice starts at a requested alignment.
///
/// Direct I/O requires buffer addresses aligned to the logical block size;
/// this stays in safe Rust by over-allocating and exposing an aligned
/// subslice of the original storage.
#[derive(Debug, Clone)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    #[must_use]
    pub fn zeroed(size: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1).next_power_of_two();
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }
        let storage = vec![0_u8; size + alignment - 1];
        let misalignment = (storage.as_ptr() as usize) & (alignment - 1);
        let start = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        debug_assert!(start + size <= storage.len());
        Self {
            storage,
            start,
            len: size,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.start + self.len);
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Works for regular files and raw block devices. `FileExt` is thread-safe
/// and does not share a seek position.
#[derive(Debug)]
pub struct FileByteDevice {
    file: Arc<File>,
}

impl FileByteDevice {
    /// Open an existing path read-write.
    pub fn open_rw(path: impl AsRef<Path>, io_path: IoPath) -> Result<Self> {
        Self::open_inner(path.as_ref(), io_path, true, false)
    }

    /// Open read-write, creating the file if the path does not exist.
    pub fn open_or_create(path: impl AsRef<Path>, io_path: IoPath) -> Result<Self> {
        Self::open_inner(path.as_ref(), io_path, true, true)
    }

    /// Open an existing path read-only.
    pub fn open_readonly(path: impl AsRef<Path>, io_path: IoPath) -> Result<Self> {
        Self::open_inner(path.as_ref(), io_path, false, false)
    }

    fn open_inner(path: &Path, io_path: IoPath, write: bool, create: bool) -> Result<Self> {
        let mut flags = 0;
        if io_path.directio {
            flags |= libc::O_DIRECT;
        }
        if io_path.sync {
            flags |= libc::O_SYNC;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .create(create)
            .custom_flags(flags)
            .open(path)?;
        trace!(
            target: "sbd::store::io",
            event = "open",
            path = %path.display(),
            write = write,
            directio = io_path.directio,
            sync = io_path.sync
        );
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Memory-backed byte device; grows on write.
///
/// Backs the stree-ramdisk test mode, where the tree is real but nothing
/// touches disk.
#[derive(Debug, Default)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset.0)
            .map_err(|_| SbdError::InvalidParameter("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SbdError::InvalidParameter("read range overflow".to_owned()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(SbdError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory store",
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(offset.0)
            .map_err(|_| SbdError::InvalidParameter("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| SbdError::InvalidParameter("write range overflow".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
