//! In-process stand-in for the kernel control channel.
//!
//! Behaves like the real kernel's device table: create/destroy/enumerate,
//! plus a per-device request queue the callback loop drains. Tests submit
//! requests and read replies over channels; destroying a device wakes its
//! handler and ends the loop, exactly as the kernel does.

use crate::{BlockStorage, ControlChannel, DeviceStatus, DeviceStatusMap};
use parking_lot::{Condvar, Mutex};
use sbd_error::{Result, SbdError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

/// Replies carry the errno on failure, mirroring the wire convention.
pub type IoReply<T> = std::result::Result<T, i32>;

enum FakeIo {
    Read {
        offset: u64,
        len: u32,
        reply: Sender<IoReply<Vec<u8>>>,
    },
    Write {
        offset: u64,
        data: Vec<u8>,
        reply: Sender<IoReply<()>>,
    },
    Flush {
        reply: Sender<IoReply<()>>,
    },
}

#[derive(Default)]
struct DeviceShared {
    queue: Mutex<QueueState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<FakeIo>,
    destroyed: bool,
}

impl DeviceShared {
    fn destroy(&self) {
        self.queue.lock().destroyed = true;
        self.wakeup.notify_all();
    }

    fn push(&self, io: FakeIo) {
        self.queue.lock().pending.push_back(io);
        self.wakeup.notify_all();
    }

    /// Block until a request arrives or the device is destroyed.
    fn next(&self) -> Option<FakeIo> {
        let mut state = self.queue.lock();
        loop {
            if let Some(io) = state.pending.pop_front() {
                return Some(io);
            }
            if state.destroyed {
                return None;
            }
            self.wakeup.wait(&mut state);
        }
    }
}

struct FakeEntry {
    status: DeviceStatus,
    shared: Arc<DeviceShared>,
}

#[derive(Default)]
struct FakeState {
    // keyed by lower-cased name, like the kernel's table
    devices: BTreeMap<String, FakeEntry>,
    next_handle: u32,
}

/// Shareable fake kernel; clones observe the same device table.
#[derive(Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<FakeState>>,
}

impl FakeKernel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shared_for(&self, name: &str) -> Result<(Arc<DeviceShared>, u32)> {
        let state = self.state.lock();
        let entry = state
            .devices
            .get(&name.to_lowercase())
            .ok_or_else(|| SbdError::Kernel {
                errno: libc::ENOENT,
                detail: format!("no active device named {name}"),
            })?;
        Ok((Arc::clone(&entry.shared), entry.status.handle_id))
    }

    /// Submit a read; the reply arrives once a handler services it.
    pub fn submit_read(&self, name: &str, offset: u64, len: u32) -> Result<Receiver<IoReply<Vec<u8>>>> {
        let (shared, _) = self.shared_for(name)?;
        let (reply, rx) = channel();
        shared.push(FakeIo::Read { offset, len, reply });
        Ok(rx)
    }

    /// Submit a write; the reply arrives once a handler services it.
    pub fn submit_write(
        &self,
        name: &str,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Receiver<IoReply<()>>> {
        let (shared, _) = self.shared_for(name)?;
        let (reply, rx) = channel();
        shared.push(FakeIo::Write { offset, data, reply });
        Ok(rx)
    }

    /// Submit a flush barrier.
    pub fn submit_flush(&self, name: &str) -> Result<Receiver<IoReply<()>>> {
        let (shared, _) = self.shared_for(name)?;
        let (reply, rx) = channel();
        shared.push(FakeIo::Flush { reply });
        Ok(rx)
    }
}

impl ControlChannel for FakeKernel {
    fn create_block_device(
        &self,
        name: &str,
        kernel_block_size: u32,
        number_of_blocks: u64,
        timeout_seconds: u32,
    ) -> Result<u32> {
        let mut state = self.state.lock();
        let key = name.to_lowercase();
        if state.devices.contains_key(&key) {
            return Err(SbdError::Kernel {
                errno: libc::EEXIST,
                detail: format!("device {name} already exists"),
            });
        }
        state.next_handle += 1;
        let handle_id = state.next_handle;
        state.devices.insert(
            key,
            FakeEntry {
                status: DeviceStatus {
                    device_name: name.to_owned(),
                    size: number_of_blocks * u64::from(kernel_block_size),
                    kernel_block_size,
                    number_of_blocks,
                    timeout_seconds,
                    handle_id,
                },
                shared: Arc::new(DeviceShared::default()),
            },
        );
        Ok(handle_id)
    }

    fn destroy_block_device_by_name(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .devices
            .remove(&name.to_lowercase())
            .ok_or_else(|| SbdError::Kernel {
                errno: libc::ENOENT,
                detail: format!("no active device named {name}"),
            })?;
        entry.shared.destroy();
        Ok(())
    }

    fn destroy_all_block_devices(&self) -> Result<()> {
        let mut state = self.state.lock();
        for (_, entry) in std::mem::take(&mut state.devices) {
            entry.shared.destroy();
        }
        Ok(())
    }

    fn device_status_map(&self) -> Result<DeviceStatusMap> {
        let state = self.state.lock();
        Ok(state
            .devices
            .iter()
            .map(|(key, entry)| (key.clone(), entry.status.clone()))
            .collect())
    }

    fn service_requests(
        &self,
        handle_id: u32,
        device_name: &str,
        storage: &mut dyn BlockStorage,
    ) -> Result<()> {
        let shared = {
            let state = self.state.lock();
            let entry = state
                .devices
                .get(&device_name.to_lowercase())
                .ok_or_else(|| SbdError::Kernel {
                    errno: libc::ENOENT,
                    detail: format!("no active device named {device_name}"),
                })?;
            if entry.status.handle_id != handle_id {
                return Err(SbdError::Kernel {
                    errno: libc::EINVAL,
                    detail: format!("handle {handle_id} does not match device {device_name}"),
                });
            }
            Arc::clone(&entry.shared)
        };

        while let Some(io) = shared.next() {
            match io {
                FakeIo::Read { offset, len, reply } => {
                    let outcome = storage.read(offset, len).map_err(|err| err.to_errno());
                    let _ = reply.send(outcome);
                }
                FakeIo::Write { offset, data, reply } => {
                    let outcome = storage.write(offset, &data).map_err(|err| err.to_errno());
                    let _ = reply.send(outcome);
                }
                FakeIo::Flush { reply } => {
                    let outcome = storage.flush().map_err(|err| err.to_errno());
                    let _ = reply.send(outcome);
                }
            }
        }
        Ok(())
    }
}
