#![forbid(unsafe_code)]
//! Block-device lifecycle controller.
//!
//! Owns the catalog, the backing-store lifecycle, and the conversation with
//! the kernel control channel. Every operation reloads the catalog from disk
//! before acting; the kernel's active-device table is queried per call and
//! never cached. Start is two-phase: validate in the caller's process, then
//! re-execute this binary as a detached daemon child that services the block
//! I/O callback loop.

pub mod diag;
pub mod host;
pub mod pipeline;
pub mod storage;

pub use host::{Host, HostSystem};
pub use pipeline::{Pipeline, PipelineStage};

use sbd_catalog::Catalog;
use sbd_error::{Result, SbdError};
use sbd_kmod::{ControlChannel, DeviceStatusMap, active_map_contains};
use sbd_store::{IoPath, Stree, StreeBacking};
use sbd_types::{DeviceSpec, KERNEL_TIMEOUT_SECONDS, PHYSICAL_BLOCK_SIZE};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use storage::{RamdiskStorage, StreeStorage};

/// Per-invocation start options.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Bring the backing store up even if it was not cleanly shut down.
    pub force: bool,
    /// Replace the entire backing store with a ramdisk (no tree).
    pub device_ramdisk: bool,
    /// Keep the tree but back it with memory instead of the storage file.
    pub stree_ramdisk: bool,
    /// Internal: this process is the re-executed daemon child.
    pub daemon: bool,
}

/// What actually services I/O for a started device.
enum Runtime {
    Ram(RamdiskStorage),
    Stree(Stree),
}

/// The lifecycle controller.
pub struct Controller {
    catalog: Catalog,
    control: Arc<dyn ControlChannel>,
    host: Arc<dyn HostSystem>,
}

impl Controller {
    pub fn new(
        catalog_file: impl Into<PathBuf>,
        control: Arc<dyn ControlChannel>,
        host: Arc<dyn HostSystem>,
    ) -> Self {
        Self {
            catalog: Catalog::new(catalog_file),
            control,
            host,
        }
    }

    fn active_devices(&self) -> Result<DeviceStatusMap> {
        self.control.device_status_map()
    }

    // ── add / delete ────────────────────────────────────────────────────────

    /// Register a new device and initialize its backing store.
    ///
    /// A failure after the store is initialized but before the catalog entry
    /// lands leaves an orphan store; a later `add` refuses it and `delete`
    /// tolerates it, so the operator can always recover.
    pub fn add(&mut self, mut spec: DeviceSpec) -> Result<()> {
        spec.validate()?;
        match self.catalog.find(&spec.device_name) {
            Ok(_) => {
                return Err(SbdError::AlreadyExists(format!(
                    "cannot add {}, device name already exists in the catalog",
                    spec.device_name
                )));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let mut stree = self.build_stree(&mut spec, StartOptions::default())?;
        let initialized = match stree.is_initialized() {
            Ok(initialized) => initialized,
            // a storage file that does not exist yet is simply uninitialized
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(err),
        };
        if initialized {
            return Err(SbdError::BackingStoreNotEmpty(spec.storage_file.clone()));
        }

        stree.init()?;
        stree.shutdown()?;

        self.catalog.insert(spec.clone())?;
        info!(
            target: "sbd::control",
            event = "add",
            device = %spec.device_name,
            storage_file = %spec.storage_file,
            node_calculated_size = spec.node_calculated_size
        );
        Ok(())
    }

    /// Remove a device from the catalog and destroy its on-disk contents.
    ///
    /// A backing store that cannot even be validated must not strand the
    /// catalog entry, so validation failures are logged and deregistration
    /// proceeds; wipe failures propagate so the operator knows cleanup was
    /// incomplete.
    pub fn delete(&mut self, device_name: &str) -> Result<()> {
        let active = self.active_devices()?;
        if active_map_contains(&active, device_name) {
            return Err(SbdError::AlreadyStarted(format!(
                "block device: {device_name} can not be deleted while it is started"
            )));
        }

        let mut spec = self.catalog.find(device_name)?;

        match self.device_startup(&mut spec, StartOptions {
            force: true,
            ..StartOptions::default()
        }) {
            Ok(Runtime::Stree(mut stree)) => {
                stree.wipe()?;
                stree.dispose()?;
            }
            Ok(Runtime::Ram(_)) => {}
            Err(SbdError::Uninitialized) => {
                info!(
                    target: "sbd::control",
                    event = "delete_skip_wipe",
                    device = device_name,
                    reason = "backing storage is not initialized, can not wipe it"
                );
            }
            Err(err) => {
                info!(
                    target: "sbd::control",
                    event = "delete_validation_failed",
                    device = device_name,
                    error = %err
                );
            }
        }

        self.catalog.delete(&spec.device_name)?;
        info!(
            target: "sbd::control",
            event = "delete",
            device = device_name,
            detail = "removed from the catalog and the backing data destroyed"
        );
        Ok(())
    }

    // ── start / stop ────────────────────────────────────────────────────────

    /// Attach a device to the kernel and begin servicing I/O.
    pub fn start(
        &mut self,
        device_name: &str,
        options: StartOptions,
        data_pipeline: &mut Pipeline,
    ) -> Result<()> {
        if options.device_ramdisk && options.stree_ramdisk {
            return Err(SbdError::InvalidParameter(
                "you can only select one of device-ramdisk and stree-ramdisk".to_owned(),
            ));
        }
        self.start_inner(device_name, options, data_pipeline, true)
    }

    fn start_inner(
        &mut self,
        device_name: &str,
        options: StartOptions,
        data_pipeline: &mut Pipeline,
        bind_stages: bool,
    ) -> Result<()> {
        let spec = self.catalog.find(device_name)?;

        let active = self.active_devices()?;
        if active_map_contains(&active, device_name) {
            return Err(SbdError::AlreadyStarted(format!(
                "block device: {device_name} is already started"
            )));
        }

        if bind_stages {
            for stage in data_pipeline.iter_mut() {
                stage.bind_parameters(&options)?;
            }
        }

        let result = self.run_block_device(spec, options, data_pipeline);
        if result.is_ok() && options.daemon {
            info!(target: "sbd::control", event = "device_shutdown_complete", device = device_name);
        }
        result
    }

    fn run_block_device(
        &mut self,
        mut spec: DeviceSpec,
        options: StartOptions,
        data_pipeline: &mut Pipeline,
    ) -> Result<()> {
        if !options.daemon {
            info!(target: "sbd::control", event = "validation_phase_start", device = %spec.device_name);
        }

        // the catalog file is operator-editable, so the cheap size checks
        // run again here even though add enforced them
        if spec.size % u64::from(PHYSICAL_BLOCK_SIZE) != 0 {
            return Err(SbdError::InvalidParameter(format!(
                "block device size is not a multiple of {PHYSICAL_BLOCK_SIZE}"
            )));
        }
        if spec.size < sbd_types::ONE_MEG {
            return Err(SbdError::InvalidParameter(format!(
                "block device size must be at least {}",
                sbd_types::ONE_MEG
            )));
        }
        let number_of_blocks = spec.kernel_block_count();

        let mut runtime = self.device_startup(&mut spec, options).map_err(|err| {
            error!(
                target: "sbd::control",
                event = "backing_store_startup_failed",
                device = %spec.device_name,
                error = %err
            );
            err
        })?;

        let result =
            self.drive_kernel_device(&spec, options, data_pipeline, &mut runtime, number_of_blocks);
        Self::device_shutdown(&mut runtime);
        result
    }

    /// Everything between backing-store bring-up and teardown; the caller
    /// guarantees `runtime` is shut down afterwards on every path.
    fn drive_kernel_device(
        &mut self,
        spec: &DeviceSpec,
        options: StartOptions,
        data_pipeline: &mut Pipeline,
        runtime: &mut Runtime,
        number_of_blocks: u64,
    ) -> Result<()> {
        // stages get one last look now that the node size is final
        for stage in data_pipeline.iter_mut() {
            stage.finalize_device(spec)?;
        }

        let handle_id = self.control.create_block_device(
            &spec.device_name,
            PHYSICAL_BLOCK_SIZE,
            number_of_blocks,
            KERNEL_TIMEOUT_SECONDS,
        )?;

        if options.daemon {
            self.attempt_mount(spec);
            let served = match runtime {
                Runtime::Ram(ram) => {
                    self.control
                        .service_requests(handle_id, &spec.device_name, ram)
                }
                Runtime::Stree(stree) => {
                    let mut adapter = StreeStorage::new(stree, data_pipeline, spec.size);
                    self.control
                        .service_requests(handle_id, &spec.device_name, &mut adapter)
                }
            };
            return served.map_err(|err| {
                // a failed handler means nobody else will clean up the
                // kernel device
                if let Err(cleanup) = self
                    .control
                    .destroy_block_device_by_name(&spec.device_name)
                {
                    error!(
                        target: "sbd::control",
                        event = "handler_cleanup_failed",
                        device = %spec.device_name,
                        error = %cleanup
                    );
                }
                err
            });
        }

        // validation phase: tear everything back down and hand off to the
        // daemon child
        if let Err(err) = self.control.destroy_block_device_by_name(&spec.device_name) {
            error!(
                target: "sbd::control",
                event = "validation_cleanup_failed",
                device = %spec.device_name,
                error = %err
            );
        }
        Self::device_shutdown(runtime);
        info!(target: "sbd::control", event = "validation_phase_complete", device = %spec.device_name);
        info!(target: "sbd::control", event = "starting_device", device = %spec.device_name);
        self.host.respawn_daemon(&spec.device_name)
    }

    /// Cleanly shut down a running device, unmounting first when asked.
    pub fn stop(&mut self, device_name: &str) -> Result<()> {
        let active = self.active_devices()?;
        if !active_map_contains(&active, device_name) {
            return Err(SbdError::NotRunning(format!(
                "can't shutdown block device: {device_name} not found"
            )));
        }

        let spec = self.catalog.find(device_name)?;

        self.host.sync();

        if spec.mount {
            // an unmount failure intentionally leaves the device up so no
            // data is lost; the operator retries
            if let Err(err) = self.attempt_unmount(&spec) {
                warn!(
                    target: "sbd::control",
                    event = "unmount_failed",
                    device = device_name,
                    error = %err
                );
                return Ok(());
            }
        }

        self.control.destroy_block_device_by_name(&spec.device_name)
    }

    /// Start every catalog entry not excluded from bulk start. Failures are
    /// collected; the batch never aborts early.
    pub fn start_all(&mut self, force: bool, data_pipeline: &mut Pipeline) -> Result<()> {
        info!(target: "sbd::control", event = "start_all");
        let options = StartOptions {
            force,
            ..StartOptions::default()
        };
        for stage in data_pipeline.iter_mut() {
            stage.bind_parameters(&options)?;
        }

        let entries = self.catalog.entries()?;
        let mut failed: Vec<String> = Vec::new();
        for entry in entries {
            if entry.exclude_from_start_all {
                continue;
            }
            if let Err(err) = self.start_inner(&entry.device_name, options, data_pipeline, false) {
                error!(
                    target: "sbd::control",
                    event = "start_failed",
                    device = %entry.device_name,
                    error = %err
                );
                failed.push(entry.device_name.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SbdError::BatchFailed {
                operation: "start",
                devices: failed,
            })
        }
    }

    /// Stop every active device, catalog-listed or not. Failures are
    /// collected; the batch never aborts early.
    pub fn stop_all(&mut self) -> Result<()> {
        let active = self.active_devices()?;
        let mut failed: Vec<String> = Vec::new();
        for name in active.keys() {
            info!(target: "sbd::control", event = "stop_all_entry", device = %name);
            if let Err(err) = self.stop(name) {
                error!(
                    target: "sbd::control",
                    event = "stop_failed",
                    device = %name,
                    error = %err
                );
                failed.push(name.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SbdError::BatchFailed {
                operation: "shut down",
                devices: failed,
            })
        }
    }

    // ── catalog surface ─────────────────────────────────────────────────────

    /// One entry, original casing, by case-insensitive name.
    pub fn catalog_entry(&mut self, device_name: &str) -> Result<DeviceSpec> {
        self.catalog.find(device_name)
    }

    /// All entries.
    pub fn catalog_entries(&mut self) -> Result<Vec<DeviceSpec>> {
        self.catalog.entries()
    }

    /// Flip one entry's bulk-start exclusion.
    pub fn set_exclude(&mut self, device_name: &str, exclude: bool) -> Result<()> {
        self.catalog.set_exclude(device_name, exclude)
    }

    // ── kernel surface ──────────────────────────────────────────────────────

    /// Active-device table straight from the kernel.
    pub fn device_status(&self) -> Result<DeviceStatusMap> {
        self.active_devices()
    }

    /// Emergency teardown of one kernel device, catalog or not.
    pub fn destroy_device(&self, device_name: &str) -> Result<()> {
        if device_name.is_empty() {
            return Err(SbdError::InvalidParameter(
                "device name required to destroy block device".to_owned(),
            ));
        }
        self.control.destroy_block_device_by_name(device_name)
    }

    /// Emergency teardown of every kernel device.
    pub fn destroy_all_devices(&self) -> Result<()> {
        self.control.destroy_all_block_devices()
    }

    /// Read a backing-store header without a catalog entry.
    pub fn storage_status(storage_file: &str) -> Result<sbd_store::StoreHeader> {
        let store = sbd_store::AlignedStore::open_header_probe(storage_file)?;
        store.load_header()
    }

    // ── diagnostics ─────────────────────────────────────────────────────────

    pub fn dump_header(&mut self, device_name: &str) -> Result<diag::Dump> {
        let spec = self.catalog.find(device_name)?;
        diag::dump_header(&spec)
    }

    pub fn dump_node_header(&mut self, device_name: &str, block_index: u32) -> Result<diag::Dump> {
        let spec = self.catalog.find(device_name)?;
        diag::dump_node_header(&spec, block_index)
    }

    pub fn dump_block(&mut self, device_name: &str, block_index: u32) -> Result<()> {
        let spec = self.catalog.find(device_name)?;
        diag::dump_block(&spec, block_index)
    }

    // ── device plumbing ─────────────────────────────────────────────────────

    fn build_stree(&self, spec: &mut DeviceSpec, options: StartOptions) -> Result<Stree> {
        let backing = if options.stree_ramdisk {
            StreeBacking::Memory
        } else {
            StreeBacking::File {
                path: PathBuf::from(&spec.storage_file),
                io_path: IoPath {
                    directio: spec.directio,
                    sync: spec.sync,
                },
            }
        };
        Stree::from_spec(spec, backing)
    }

    /// Bring up whatever will service I/O for this device.
    fn device_startup(&self, spec: &mut DeviceSpec, options: StartOptions) -> Result<Runtime> {
        if options.device_ramdisk {
            return Ok(Runtime::Ram(RamdiskStorage::new(spec.size)));
        }
        let mut stree = self.build_stree(spec, options)?;
        if options.stree_ramdisk {
            // a memory store is born empty every time
            stree.init()?;
        }
        stree.startup(options.force)?;
        Ok(Runtime::Stree(stree))
    }

    /// Quietly tolerant of being called twice on the same runtime.
    fn device_shutdown(runtime: &mut Runtime) {
        if let Runtime::Stree(stree) = runtime {
            if let Err(err) = stree.shutdown() {
                error!(
                    target: "sbd::control",
                    event = "backing_store_shutdown_failed",
                    error = %err
                );
            }
        }
    }

    /// Fire-and-forget mount worker. The mount command blocks until the
    /// kernel device is serviceable, which is fine because the I/O loop is
    /// about to run; the worker holds no locks and just logs its outcome.
    fn attempt_mount(&self, spec: &DeviceSpec) {
        if !spec.mount {
            return;
        }
        let host = Arc::clone(&self.host);
        let device_path = spec.device_path();
        let mountpoint = spec.mountpoint.clone();
        info!(
            target: "sbd::control",
            event = "mount_attempt",
            device_path = %device_path,
            mountpoint = %mountpoint
        );
        std::thread::spawn(move || match host.mount(&device_path, &mountpoint) {
            Ok(()) => info!(target: "sbd::control", event = "mount_complete", mountpoint = %mountpoint),
            Err(err) => {
                error!(target: "sbd::control", event = "mount_failed", mountpoint = %mountpoint, error = %err);
            }
        });
    }

    fn attempt_unmount(&self, spec: &DeviceSpec) -> Result<()> {
        if !self.host.is_mounted(&spec.mountpoint)? {
            info!(
                target: "sbd::control",
                event = "unmount_skipped",
                mountpoint = %spec.mountpoint,
                reason = "not mounted"
            );
            return Ok(());
        }
        info!(
            target: "sbd::control",
            event = "unmount_attempt",
            device_path = %spec.device_path(),
            mountpoint = %spec.mountpoint
        );
        self.host.unmount(&spec.mountpoint)
    }
}
