#![forbid(unsafe_code)]
//! Persistent catalog of declared block devices.
//!
//! The catalog is a single TOML document mapping case-preserved device names
//! to their [`DeviceSpec`]. The file is the source of truth: every operation
//! re-reads it before acting, and every mutation rewrites it whole. An
//! advisory lock narrows the load-modify-store race window between
//! concurrent controller invocations; it does not eliminate it, and the
//! operational cadence makes the remainder acceptable.

use sbd_error::{Result, SbdError};
use sbd_kmod::FileLock;
use sbd_types::DeviceSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    devices: BTreeMap<String, DeviceSpec>,
}

/// Handle on the catalog file.
pub struct Catalog {
    catalog_file: PathBuf,
    document: CatalogDocument,
}

impl Catalog {
    #[must_use]
    pub fn new(catalog_file: impl Into<PathBuf>) -> Self {
        Self {
            catalog_file: catalog_file.into(),
            document: CatalogDocument::default(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.catalog_file
    }

    fn lock_file(&self) -> PathBuf {
        let mut name = self
            .catalog_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "catalog".to_owned());
        name.push_str(".lock");
        self.catalog_file.with_file_name(name)
    }

    /// Reload the document from disk. A missing file yields an empty
    /// catalog; anything else that prevents reading it is corruption.
    pub fn load(&mut self) -> Result<()> {
        let text = match std::fs::read_to_string(&self.catalog_file) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.document = CatalogDocument::default();
                return Ok(());
            }
            Err(err) => {
                return Err(SbdError::CatalogCorrupt {
                    path: self.catalog_file.display().to_string(),
                    detail: err.to_string(),
                });
            }
        };
        self.document = toml::from_str(&text).map_err(|err| SbdError::CatalogCorrupt {
            path: self.catalog_file.display().to_string(),
            detail: err.to_string(),
        })?;
        Ok(())
    }

    /// Rewrite the whole document: create-or-truncate, write, close.
    pub fn save(&self) -> Result<()> {
        let text = toml::to_string_pretty(&self.document).map_err(|err| {
            SbdError::CatalogWriteFailed {
                path: self.catalog_file.display().to_string(),
                detail: err.to_string(),
            }
        })?;
        std::fs::write(&self.catalog_file, text).map_err(|err| SbdError::CatalogWriteFailed {
            path: self.catalog_file.display().to_string(),
            detail: err.to_string(),
        })?;
        debug!(
            target: "sbd::catalog",
            event = "save",
            path = %self.catalog_file.display(),
            entries = self.document.devices.len()
        );
        Ok(())
    }

    /// Case-insensitive lookup, returning the entry with its original
    /// casing.
    pub fn find(&mut self, device_name: &str) -> Result<DeviceSpec> {
        self.load()?;
        self.find_loaded(device_name)
            .cloned()
            .ok_or_else(|| SbdError::NotFound(format!("device: {device_name} not found")))
    }

    fn find_loaded(&self, device_name: &str) -> Option<&DeviceSpec> {
        let wanted = device_name.to_lowercase();
        self.document
            .devices
            .values()
            .find(|spec| spec.device_name.to_lowercase() == wanted)
    }

    /// All entries, in document order.
    pub fn entries(&mut self) -> Result<Vec<DeviceSpec>> {
        self.load()?;
        Ok(self.document.devices.values().cloned().collect())
    }

    /// Insert a new entry. The name must not exist under any casing.
    pub fn insert(&mut self, spec: DeviceSpec) -> Result<()> {
        let _lock = FileLock::exclusive(self.lock_file())?;
        self.load()?;
        if self.find_loaded(&spec.device_name).is_some() {
            return Err(SbdError::AlreadyExists(format!(
                "cannot add {}, device name already exists in the catalog",
                spec.device_name
            )));
        }
        let key = spec.device_name.clone();
        self.document.devices.insert(key, spec);
        self.save()
    }

    /// Remove the case-insensitive match for `device_name`.
    pub fn delete(&mut self, device_name: &str) -> Result<()> {
        let _lock = FileLock::exclusive(self.lock_file())?;
        self.load()?;
        let wanted = device_name.to_lowercase();
        let key = self
            .document
            .devices
            .iter()
            .find(|(_, spec)| spec.device_name.to_lowercase() == wanted)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| {
                SbdError::NotFound(format!("device {device_name} not found to delete"))
            })?;
        self.document.devices.remove(&key);
        self.save()?;
        info!(target: "sbd::catalog", event = "delete", device = device_name);
        Ok(())
    }

    /// Flip one entry's start-all exclusion and persist.
    pub fn set_exclude(&mut self, device_name: &str, exclude: bool) -> Result<()> {
        let _lock = FileLock::exclusive(self.lock_file())?;
        self.load()?;
        let wanted = device_name.to_lowercase();
        let entry = self
            .document
            .devices
            .values_mut()
            .find(|spec| spec.device_name.to_lowercase() == wanted)
            .ok_or_else(|| SbdError::NotFound(format!("device {device_name} not found")))?;
        entry.exclude_from_start_all = exclude;
        self.save()
    }

}
