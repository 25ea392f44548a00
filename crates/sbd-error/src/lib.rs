#![forbid(unsafe_code)]
//! Error types for sbd.
//!
//! Defines `SbdError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings so CLI exit paths can surface host error codes.

use thiserror::Error;

/// Unified error type for all sbd operations.
#[derive(Debug, Error)]
pub enum SbdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("block device {0} is already started")]
    AlreadyStarted(String),

    #[error("block device {0} is not running")]
    NotRunning(String),

    #[error("backing store {0} contains data")]
    BackingStoreNotEmpty(String),

    #[error("backing store is uninitialized")]
    Uninitialized,

    #[error("unable to read catalog file {path}: {detail}")]
    CatalogCorrupt { path: String, detail: String },

    #[error("unable to write catalog file {path}: {detail}")]
    CatalogWriteFailed { path: String, detail: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("kernel error (errno {errno}): {detail}")]
    Kernel { errno: i32, detail: String },

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("sanity failure: {0}")]
    SanityFailure(String),

    #[error("the following devices failed to {} cleanly:{}", .operation, format_device_list(.devices))]
    BatchFailed {
        operation: &'static str,
        devices: Vec<String>,
    },
}

fn format_device_list(devices: &[String]) -> String {
    devices.iter().fold(String::new(), |mut acc, name| {
        acc.push(' ');
        acc.push_str(name);
        acc
    })
}

impl SbdError {
    /// Convert this error into a POSIX errno suitable for process exit codes.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) | Self::BackingStoreNotEmpty(_) => libc::EEXIST,
            Self::AlreadyStarted(_) => libc::EALREADY,
            Self::NotRunning(_) => libc::ESRCH,
            Self::Uninitialized => libc::ENODATA,
            Self::CatalogCorrupt { .. } | Self::SanityFailure(_) => libc::EIO,
            Self::CatalogWriteFailed { .. } => libc::EIO,
            Self::InvalidParameter(_) => libc::EINVAL,
            Self::Kernel { errno, .. } => *errno,
            Self::MountFailed(_) => libc::EBUSY,
            Self::BatchFailed { .. } => libc::EIO,
        }
    }

    /// True when the error means "the named thing does not exist".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result alias using `SbdError`.
pub type Result<T> = std::result::Result<T, SbdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_host_codes() {
        assert_eq!(
            SbdError::NotFound("d1".to_owned()).to_errno(),
            libc::ENOENT
        );
        assert_eq!(SbdError::Uninitialized.to_errno(), libc::ENODATA);
        assert_eq!(
            SbdError::AlreadyStarted("d1".to_owned()).to_errno(),
            libc::EALREADY
        );
        assert_eq!(
            SbdError::InvalidParameter("size".to_owned()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(
            SbdError::Kernel {
                errno: libc::EBUSY,
                detail: "device busy".to_owned()
            }
            .to_errno(),
            libc::EBUSY
        );
    }

    #[test]
    fn batch_error_names_every_device() {
        let err = SbdError::BatchFailed {
            operation: "start",
            devices: vec!["a".to_owned(), "b".to_owned()],
        };
        let msg = err.to_string();
        assert!(msg.contains("start"));
        assert!(msg.contains(" a"));
        assert!(msg.contains(" b"));
    }

    #[test]
    fn io_not_found_is_not_found() {
        let err = SbdError::Io(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert!(err.is_not_found());
        assert!(!SbdError::Uninitialized.is_not_found());
    }
}
