//! Raw zosbd2 ioctl ABI.
//!
//! Struct layouts and command numbers mirror the kernel module's control
//! interface. All unsafe in the workspace funnels through this module; every
//! ioctl passes a `#[repr(C)]` struct whose size is baked into the command
//! code, so a mismatched kernel rejects the call instead of corrupting
//! memory.

use crate::{BlockStorage, DeviceStatus, DeviceStatusMap};
use sbd_error::{Result, SbdError};
use std::fs::File;
use std::os::fd::AsRawFd;
use tracing::trace;

pub const MAX_DEVICE_NAME_LENGTH: usize = 32;
const MAX_STATUS_ENTRIES: usize = 64;
/// Largest payload one kernel request can carry (bytes).
const MAX_OPERATION_PAYLOAD: usize = 1 << 20;

// ── _IOC encoding (asm-generic) ─────────────────────────────────────────────

const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = 8;
const IOC_SIZESHIFT: u64 = 16;
const IOC_DIRSHIFT: u64 = 30;
const IOC_READ: u64 = 2;
const IOC_WRITE: u64 = 1;

const ZOSBD2_IOC_MAGIC: u64 = b'z' as u64;

const fn iowr(nr: u64, size: usize) -> u64 {
    ((IOC_READ | IOC_WRITE) << IOC_DIRSHIFT)
        | (ZOSBD2_IOC_MAGIC << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u64) << IOC_SIZESHIFT)
}

// ── control structs ─────────────────────────────────────────────────────────

#[repr(C)]
struct CreateParams {
    device_name: [u8; MAX_DEVICE_NAME_LENGTH],
    kernel_block_size: u32,
    number_of_blocks: u64,
    device_timeout_seconds: u32,
    handle_id: u32,
    error: i32,
}

#[repr(C)]
struct DestroyByNameParams {
    device_name: [u8; MAX_DEVICE_NAME_LENGTH],
    error: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct StatusEntry {
    device_name: [u8; MAX_DEVICE_NAME_LENGTH],
    size: u64,
    kernel_block_size: u32,
    number_of_blocks: u64,
    timeout_seconds: u32,
    handle_id: u32,
}

#[repr(C)]
struct StatusList {
    count: u32,
    entries: [StatusEntry; MAX_STATUS_ENTRIES],
}

/// One block request exchange. Userspace commits the previous completion and
/// fetches the next request in a single blocking ioctl.
#[repr(C)]
struct Operation {
    handle_id: u32,
    /// In: the completed operation (or `OP_NONE` on the first call).
    /// Out: what the kernel wants next.
    operation: u32,
    /// Completion status, negative errno convention.
    error: i32,
    operation_id: u64,
    offset: u64,
    length: u64,
    payload: [u8; MAX_OPERATION_PAYLOAD],
}

const OP_NONE: u32 = 0;
const OP_READ: u32 = 1;
const OP_WRITE: u32 = 2;
const OP_DISCARD: u32 = 3;
const OP_FLUSH: u32 = 4;
const OP_DESTROYED: u32 = 5;
const OP_COMPLETE: u32 = 0x100;

const IOCTL_CREATE_DEVICE: u64 = iowr(0x21, std::mem::size_of::<CreateParams>());
const IOCTL_DESTROY_DEVICE_BY_NAME: u64 = iowr(0x22, std::mem::size_of::<DestroyByNameParams>());
const IOCTL_DESTROY_ALL_DEVICES: u64 = iowr(0x23, std::mem::size_of::<i32>());
const IOCTL_DEVICE_STATUS_LIST: u64 = iowr(0x24, std::mem::size_of::<StatusList>());
// The operation block exceeds the 14-bit _IOC size field; the command
// encodes the pointer size and the kernel trusts the fixed layout.
const IOCTL_BLOCK_FOR_REQUEST: u64 = iowr(0x41, std::mem::size_of::<*mut Operation>());

// ── helpers ─────────────────────────────────────────────────────────────────

fn kernel_errno(detail: String) -> SbdError {
    SbdError::Kernel {
        errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
        detail,
    }
}

fn control_ioctl<T>(fd: &File, request: u64, arg: &mut T, what: &str) -> Result<()> {
    // SAFETY: `request` encodes the exact size of `T`, and `arg` outlives the
    // call; the kernel reads and writes only within that struct.
    let rc = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            request as libc::c_ulong,
            std::ptr::from_mut(arg),
        )
    };
    if rc < 0 {
        return Err(kernel_errno(format!("{what} ioctl failed")));
    }
    Ok(())
}

fn encode_name(name: &str) -> Result<[u8; MAX_DEVICE_NAME_LENGTH]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= MAX_DEVICE_NAME_LENGTH {
        return Err(SbdError::InvalidParameter(format!(
            "device name must be 1..{MAX_DEVICE_NAME_LENGTH} bytes"
        )));
    }
    let mut out = [0_u8; MAX_DEVICE_NAME_LENGTH];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn decode_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Heap-allocate a zeroed Operation; it is far too large for the stack.
fn zeroed_operation() -> Box<Operation> {
    let layout = std::alloc::Layout::new::<Operation>();
    // SAFETY: Operation is #[repr(C)] integers and byte arrays, for which
    // all-zero bytes are a valid value; the allocation matches Box's layout
    // contract for the type.
    unsafe {
        let ptr = std::alloc::alloc_zeroed(layout).cast::<Operation>();
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        Box::from_raw(ptr)
    }
}

// ── entry points ────────────────────────────────────────────────────────────

pub(crate) fn create_block_device(
    fd: &File,
    name: &str,
    kernel_block_size: u32,
    number_of_blocks: u64,
    timeout_seconds: u32,
) -> Result<u32> {
    let mut params = CreateParams {
        device_name: encode_name(name)?,
        kernel_block_size,
        number_of_blocks,
        device_timeout_seconds: timeout_seconds,
        handle_id: 0,
        error: 0,
    };
    control_ioctl(fd, IOCTL_CREATE_DEVICE, &mut params, "create device")?;
    if params.error != 0 {
        return Err(SbdError::Kernel {
            errno: -params.error,
            detail: format!("kernel refused to create device {name}"),
        });
    }
    Ok(params.handle_id)
}

pub(crate) fn destroy_block_device_by_name(fd: &File, name: &str) -> Result<()> {
    let mut params = DestroyByNameParams {
        device_name: encode_name(name)?,
        error: 0,
    };
    control_ioctl(fd, IOCTL_DESTROY_DEVICE_BY_NAME, &mut params, "destroy device")?;
    if params.error != 0 {
        return Err(SbdError::Kernel {
            errno: -params.error,
            detail: format!("kernel refused to destroy device {name}"),
        });
    }
    Ok(())
}

pub(crate) fn destroy_all_block_devices(fd: &File) -> Result<()> {
    let mut error: i32 = 0;
    control_ioctl(fd, IOCTL_DESTROY_ALL_DEVICES, &mut error, "destroy all devices")?;
    if error != 0 {
        return Err(SbdError::Kernel {
            errno: -error,
            detail: "kernel refused to destroy all devices".to_owned(),
        });
    }
    Ok(())
}

pub(crate) fn device_status_map(fd: &File) -> Result<DeviceStatusMap> {
    let mut list = StatusList {
        count: 0,
        entries: [StatusEntry {
            device_name: [0; MAX_DEVICE_NAME_LENGTH],
            size: 0,
            kernel_block_size: 0,
            number_of_blocks: 0,
            timeout_seconds: 0,
            handle_id: 0,
        }; MAX_STATUS_ENTRIES],
    };
    control_ioctl(fd, IOCTL_DEVICE_STATUS_LIST, &mut list, "device status")?;

    let mut map = DeviceStatusMap::new();
    for entry in list.entries.iter().take(list.count as usize) {
        let name = decode_name(&entry.device_name);
        map.insert(
            name.to_lowercase(),
            DeviceStatus {
                device_name: name,
                size: entry.size,
                kernel_block_size: entry.kernel_block_size,
                number_of_blocks: entry.number_of_blocks,
                timeout_seconds: entry.timeout_seconds,
                handle_id: entry.handle_id,
            },
        );
    }
    Ok(map)
}

pub(crate) fn service_requests(
    fd: &File,
    handle_id: u32,
    storage: &mut dyn BlockStorage,
) -> Result<()> {
    let mut op = zeroed_operation();
    op.handle_id = handle_id;
    op.operation = OP_NONE;

    loop {
        control_ioctl(fd, IOCTL_BLOCK_FOR_REQUEST, op.as_mut(), "block for request")?;
        let requested = op.operation;
        let len = usize::try_from(op.length).unwrap_or(usize::MAX);
        if matches!(requested, OP_READ | OP_WRITE) && len > MAX_OPERATION_PAYLOAD {
            return Err(SbdError::Kernel {
                errno: libc::EINVAL,
                detail: format!("kernel request length {len} exceeds the operation payload"),
            });
        }
        trace!(
            target: "sbd::kmod",
            event = "request",
            operation = requested,
            offset = op.offset,
            length = op.length
        );

        op.error = 0;
        match requested {
            OP_DESTROYED => return Ok(()),
            OP_READ => match storage.read(op.offset, op.length as u32) {
                Ok(data) => op.payload[..data.len()].copy_from_slice(&data),
                Err(err) => op.error = -err.to_errno(),
            },
            OP_WRITE => {
                if let Err(err) = storage.write(op.offset, &op.payload[..len]) {
                    op.error = -err.to_errno();
                }
            }
            OP_DISCARD => {
                if let Err(err) = storage.discard(op.offset, op.length as u32) {
                    op.error = -err.to_errno();
                }
            }
            OP_FLUSH => {
                if let Err(err) = storage.flush() {
                    op.error = -err.to_errno();
                }
            }
            other => {
                return Err(SbdError::Kernel {
                    errno: libc::EINVAL,
                    detail: format!("kernel sent unknown operation {other}"),
                });
            }
        }
        op.operation = OP_COMPLETE | requested;
    }
}
