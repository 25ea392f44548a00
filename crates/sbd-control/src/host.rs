//! The host-OS seam: mount/unmount subprocesses, the daemon re-exec, and
//! the global sync.
//!
//! The controller only ever talks to [`HostSystem`]; lifecycle tests swap in
//! a recording implementation so no test ever forks or mounts anything.

use sbd_error::{Result, SbdError};
use std::process::Command;
use tracing::{debug, info};

pub const MOUNT_CMD: &str = "mount";
pub const UMOUNT_CMD: &str = "umount";

/// Host operations the controller depends on.
pub trait HostSystem: Send + Sync {
    /// Flush host filesystem buffers.
    fn sync(&self);

    /// Whether anything is currently mounted at `mountpoint`.
    fn is_mounted(&self, mountpoint: &str) -> Result<bool>;

    /// Invoke the host mount utility. Blocks until the mount completes.
    fn mount(&self, device_path: &str, mountpoint: &str) -> Result<()>;

    /// Invoke the host unmount utility.
    fn unmount(&self, mountpoint: &str) -> Result<()>;

    /// Re-execute this binary as the detached daemon child for one device.
    fn respawn_daemon(&self, device_name: &str) -> Result<()>;
}

/// The real host.
#[derive(Debug, Default)]
pub struct Host;

impl Host {
    fn run_checked(command: &str, args: &[&str]) -> Result<()> {
        debug!(target: "sbd::host", event = "exec", command = command, args = ?args);
        let output = Command::new(command)
            .args(args)
            .output()
            .map_err(|err| SbdError::MountFailed(format!("error executing {command}: {err}")))?;
        if !output.status.success() {
            return Err(SbdError::MountFailed(format!(
                "{command} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl HostSystem for Host {
    fn sync(&self) {
        sbd_kmod::sync_host();
    }

    fn is_mounted(&self, mountpoint: &str) -> Result<bool> {
        // /proc/self/mounts escapes spaces as \040; mountpoints we manage are
        // plain absolute paths, so a field compare is enough.
        let mounts = std::fs::read_to_string("/proc/self/mounts")?;
        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mounted_on| mounted_on == mountpoint))
    }

    fn mount(&self, device_path: &str, mountpoint: &str) -> Result<()> {
        Self::run_checked(MOUNT_CMD, &[device_path, mountpoint])
    }

    fn unmount(&self, mountpoint: &str) -> Result<()> {
        Self::run_checked(UMOUNT_CMD, &[mountpoint])
    }

    fn respawn_daemon(&self, device_name: &str) -> Result<()> {
        let executable = std::env::current_exe().map_err(|err| {
            SbdError::InvalidParameter(format!(
                "unable to determine block device binary to execute: {err}"
            ))
        })?;
        let mut command = Command::new(&executable);
        command.args(daemon_args(device_name));
        info!(
            target: "sbd::host",
            event = "respawn",
            executable = %executable.display(),
            device = device_name
        );
        // fire and forget: the child owns its own lifetime from here
        command.spawn().map_err(|err| {
            SbdError::InvalidParameter(format!(
                "unable to start background process {}: {err}",
                executable.display()
            ))
        })?;
        Ok(())
    }
}

/// Argument vector for the daemon child, shared with the CLI definition.
#[must_use]
pub fn daemon_args(device_name: &str) -> Vec<String> {
    vec![
        "catalog".to_owned(),
        "start".to_owned(),
        "--device-name".to_owned(),
        device_name.to_owned(),
        "--here-be-dragons".to_owned(),
    ]
}
