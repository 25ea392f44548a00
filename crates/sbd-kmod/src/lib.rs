//! Kernel control client for the zosbd2 block-device shim.
//!
//! Everything the rest of the workspace knows about the kernel goes through
//! [`ControlChannel`]. The real implementation ([`KernelControl`]) opens the
//! control device and speaks the raw ioctl ABI; [`FakeKernel`] provides the
//! same surface in-process for tests. This is the one crate in the workspace
//! that contains unsafe code — the ioctl boundary and `sync(2)`.

pub mod fake;
mod sys;

pub use fake::FakeKernel;

use sbd_error::{Result, SbdError};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Status of one active kernel block device, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub device_name: String,
    pub size: u64,
    pub kernel_block_size: u32,
    pub number_of_blocks: u64,
    pub timeout_seconds: u32,
    pub handle_id: u32,
}

/// Map of active devices keyed by lower-cased device name.
pub type DeviceStatusMap = BTreeMap<String, DeviceStatus>;

/// Storage the per-device callback loop services requests against.
///
/// Offsets and lengths arrive in bytes, already multiples of the kernel
/// block size.
pub trait BlockStorage: Send {
    fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>>;
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn discard(&mut self, offset: u64, len: u32) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// The kernel-side surface the controller consumes.
///
/// Implementations open and close their transport per call; nothing is
/// pooled across operations.
pub trait ControlChannel: Send + Sync {
    /// Create a named block device; returns the kernel handle id.
    fn create_block_device(
        &self,
        name: &str,
        kernel_block_size: u32,
        number_of_blocks: u64,
        timeout_seconds: u32,
    ) -> Result<u32>;

    /// Tear down a device by name, hanging up on its userspace handler.
    fn destroy_block_device_by_name(&self, name: &str) -> Result<()>;

    /// Tear down every active device.
    fn destroy_all_block_devices(&self) -> Result<()>;

    /// Enumerate active devices. Keys are lower-cased names.
    fn device_status_map(&self) -> Result<DeviceStatusMap>;

    /// Run the block I/O callback loop for one device, translating kernel
    /// requests into `storage` calls. Returns when the kernel destroys the
    /// device; any other exit is an error.
    fn service_requests(
        &self,
        handle_id: u32,
        device_name: &str,
        storage: &mut dyn BlockStorage,
    ) -> Result<()>;
}

/// ioctl-backed control client for a real zosbd2 control device.
#[derive(Debug, Clone)]
pub struct KernelControl {
    control_device: std::path::PathBuf,
}

impl KernelControl {
    #[must_use]
    pub fn new(control_device: impl Into<std::path::PathBuf>) -> Self {
        Self {
            control_device: control_device.into(),
        }
    }

    fn open(&self) -> Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.control_device)
            .map_err(|err| SbdError::Kernel {
                errno: err.raw_os_error().unwrap_or(libc::EIO),
                detail: format!(
                    "can't open control device {}: {err}",
                    self.control_device.display()
                ),
            })
    }
}

impl ControlChannel for KernelControl {
    fn create_block_device(
        &self,
        name: &str,
        kernel_block_size: u32,
        number_of_blocks: u64,
        timeout_seconds: u32,
    ) -> Result<u32> {
        let fd = self.open()?;
        let handle_id =
            sys::create_block_device(&fd, name, kernel_block_size, number_of_blocks, timeout_seconds)?;
        info!(
            target: "sbd::kmod",
            event = "create_block_device",
            device = name,
            handle_id = handle_id,
            number_of_blocks = number_of_blocks
        );
        Ok(handle_id)
    }

    fn destroy_block_device_by_name(&self, name: &str) -> Result<()> {
        let fd = self.open()?;
        debug!(target: "sbd::kmod", event = "destroy_block_device", device = name);
        sys::destroy_block_device_by_name(&fd, name)
    }

    fn destroy_all_block_devices(&self) -> Result<()> {
        let fd = self.open()?;
        debug!(target: "sbd::kmod", event = "destroy_all_block_devices");
        sys::destroy_all_block_devices(&fd)
    }

    fn device_status_map(&self) -> Result<DeviceStatusMap> {
        let fd = self.open()?;
        sys::device_status_map(&fd)
    }

    fn service_requests(
        &self,
        handle_id: u32,
        device_name: &str,
        storage: &mut dyn BlockStorage,
    ) -> Result<()> {
        let fd = self.open()?;
        info!(target: "sbd::kmod", event = "handler_start", device = device_name, handle_id = handle_id);
        let result = sys::service_requests(&fd, handle_id, storage);
        match &result {
            Ok(()) => info!(target: "sbd::kmod", event = "handler_exit", device = device_name),
            Err(err) => {
                error!(target: "sbd::kmod", event = "handler_failed", device = device_name, error = %err);
            }
        }
        result
    }
}

/// Ask the host to flush filesystem buffers. The man page says this cannot
/// fail.
pub fn sync_host() {
    // SAFETY: sync(2) takes no arguments and touches no userspace memory.
    unsafe { libc::sync() };
}

/// Advisory exclusive lock on a path; held until dropped.
///
/// Creates the lock file when absent. Blocks until the lock is granted.
#[derive(Debug)]
pub struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    pub fn exclusive(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use std::os::fd::AsRawFd;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        // SAFETY: flock takes a valid owned descriptor and touches no
        // userspace memory.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(SbdError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;
        // SAFETY: same descriptor the lock was taken on; close would unlock
        // anyway, this just makes the release explicit.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Case-insensitive membership helper for active-device maps.
#[must_use]
pub fn active_map_contains(map: &DeviceStatusMap, name: &str) -> bool {
    map.contains_key(&name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_map_lookup_is_case_insensitive() {
        let mut map = DeviceStatusMap::new();
        map.insert(
            "foobar".to_owned(),
            DeviceStatus {
                device_name: "FooBar".to_owned(),
                size: 1024 * 1024,
                kernel_block_size: 4096,
                number_of_blocks: 256,
                timeout_seconds: 1200,
                handle_id: 1,
            },
        );
        assert!(active_map_contains(&map, "FOOBAR"));
        assert!(active_map_contains(&map, "foobar"));
        assert!(!active_map_contains(&map, "other"));
    }

    #[test]
    fn missing_control_device_reports_kernel_error() {
        let control = KernelControl::new("/nonexistent/zosbd2ctl");
        let err = control.device_status_map().unwrap_err();
        match err {
            SbdError::Kernel { errno, .. } => assert_eq!(errno, libc::ENOENT),
            other => panic!("expected Kernel error, got {other:?}"),
        }
    }
}
