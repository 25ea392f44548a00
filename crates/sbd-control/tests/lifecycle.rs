//! End-to-end lifecycle scenarios against the in-process fake kernel.
//!
//! No test here forks, mounts, or needs the kernel module: the host seam is
//! a recorder and the control channel is `FakeKernel`. The daemon child's
//! bring-up is simulated by the recorder so start/stop round-trips behave
//! like the real two-phase flow.

use sbd_control::{Controller, HostSystem, Pipeline, PipelineStage, StartOptions};
use sbd_error::{Result, SbdError};
use sbd_kmod::{ControlChannel, FakeKernel};
use sbd_store::{IoPath, Stree, StreeBacking};
use sbd_types::{DeviceSpec, ONE_MEG, PHYSICAL_BLOCK_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ── test doubles ────────────────────────────────────────────────────────────

/// Records host interactions; optionally plays the daemon child's part by
/// creating the kernel device the real child would create.
#[derive(Default)]
struct RecordingHost {
    simulate_daemon: Option<FakeKernel>,
    respawned: Mutex<Vec<String>>,
    mounts: Mutex<Vec<(String, String)>>,
    unmounts: Mutex<Vec<String>>,
    mounted: Mutex<Vec<String>>,
    fail_unmount: AtomicBool,
}

impl RecordingHost {
    fn with_daemon(kernel: FakeKernel) -> Self {
        Self {
            simulate_daemon: Some(kernel),
            ..Self::default()
        }
    }

    fn respawned_devices(&self) -> Vec<String> {
        self.respawned.lock().unwrap().clone()
    }
}

impl HostSystem for RecordingHost {
    fn sync(&self) {}

    fn is_mounted(&self, mountpoint: &str) -> Result<bool> {
        Ok(self
            .mounted
            .lock()
            .unwrap()
            .iter()
            .any(|m| m == mountpoint))
    }

    fn mount(&self, device_path: &str, mountpoint: &str) -> Result<()> {
        self.mounts
            .lock()
            .unwrap()
            .push((device_path.to_owned(), mountpoint.to_owned()));
        self.mounted.lock().unwrap().push(mountpoint.to_owned());
        Ok(())
    }

    fn unmount(&self, mountpoint: &str) -> Result<()> {
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(SbdError::MountFailed("umount exited with 32".to_owned()));
        }
        self.unmounts.lock().unwrap().push(mountpoint.to_owned());
        self.mounted.lock().unwrap().retain(|m| m != mountpoint);
        Ok(())
    }

    fn respawn_daemon(&self, device_name: &str) -> Result<()> {
        self.respawned.lock().unwrap().push(device_name.to_owned());
        if let Some(kernel) = &self.simulate_daemon {
            kernel.create_block_device(device_name, PHYSICAL_BLOCK_SIZE, 256, 1200)?;
        }
        Ok(())
    }
}

struct XorStage(u8);

impl PipelineStage for XorStage {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn encode(&self, mut data: Vec<u8>) -> Result<Vec<u8>> {
        for b in &mut data {
            *b ^= self.0;
        }
        Ok(data)
    }

    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.encode(data)
    }
}

// ── fixture helpers ─────────────────────────────────────────────────────────

struct Fixture {
    dir: tempfile::TempDir,
    kernel: FakeKernel,
    host: Arc<RecordingHost>,
}

impl Fixture {
    fn new() -> Self {
        let kernel = FakeKernel::new();
        let host = Arc::new(RecordingHost::with_daemon(kernel.clone()));
        Self {
            dir: tempfile::tempdir().unwrap(),
            kernel,
            host,
        }
    }

    fn catalog_path(&self) -> std::path::PathBuf {
        self.dir.path().join("catalog.toml")
    }

    fn controller(&self) -> Controller {
        Controller::new(
            self.catalog_path(),
            Arc::new(self.kernel.clone()),
            Arc::clone(&self.host) as Arc<dyn HostSystem>,
        )
    }

    fn spec(&self, name: &str) -> DeviceSpec {
        DeviceSpec {
            device_name: name.to_owned(),
            size: ONE_MEG,
            storage_file: self
                .dir
                .path()
                .join(format!("{}.bin", name.to_lowercase()))
                .display()
                .to_string(),
            directio: false,
            sync: false,
            alignment: 0,
            node_value_size: 4096,
            node_calculated_size: 0,
            additional_nodes_per_block: 0,
            mount: false,
            mountpoint: String::new(),
            exclude_from_start_all: false,
        }
    }
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ── scenarios ───────────────────────────────────────────────────────────────

#[test]
fn empty_catalog_bring_up() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let spec = fx.spec("d1");

    controller.add(spec.clone()).unwrap();

    assert!(fx.catalog_path().exists());
    let entry = controller.catalog_entry("d1").unwrap();
    assert_eq!(entry.device_name, "d1");
    assert_ne!(entry.node_calculated_size, 0);

    // backing file exists and carries a valid header
    assert!(std::path::Path::new(&spec.storage_file).exists());
    let header = Controller::storage_status(&spec.storage_file).unwrap();
    assert_eq!(header.store_size_in_bytes, ONE_MEG);
    assert_eq!(header.dirty, 0);
}

#[test]
fn second_add_is_rejected_and_catalog_unchanged() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    controller.add(fx.spec("d1")).unwrap();

    let err = controller.add(fx.spec("d1")).unwrap_err();
    assert!(matches!(err, SbdError::AlreadyExists(_)));
    assert_eq!(controller.catalog_entries().unwrap().len(), 1);
}

#[test]
fn add_refuses_a_backing_store_that_contains_data() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    controller.add(fx.spec("d1")).unwrap();

    // a second device pointed at the first device's initialized store
    let mut second = fx.spec("d2");
    second.storage_file = fx.spec("d1").storage_file;
    let err = controller.add(second).unwrap_err();
    assert!(matches!(err, SbdError::BackingStoreNotEmpty(_)));
}

#[test]
fn add_validates_operator_sizing() {
    let fx = Fixture::new();
    let mut controller = fx.controller();

    for size in [0_u64, 4095, ONE_MEG - 4096] {
        let mut spec = fx.spec("d1");
        spec.size = size;
        assert!(matches!(
            controller.add(spec).unwrap_err(),
            SbdError::InvalidParameter(_)
        ));
    }

    let mut directio = fx.spec("d1");
    directio.directio = true;
    directio.alignment = 1234;
    assert!(matches!(
        controller.add(directio).unwrap_err(),
        SbdError::InvalidParameter(_)
    ));

    // the smallest valid size is accepted
    controller.add(fx.spec("d1")).unwrap();
}

#[test]
fn lookup_is_case_insensitive_and_case_preserving() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    controller.add(fx.spec("FooBar")).unwrap();

    let entry = controller.catalog_entry("foobar").unwrap();
    assert_eq!(entry.device_name, "FooBar");
}

#[test]
fn delete_while_running_is_refused() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let spec = fx.spec("d1");
    controller.add(spec.clone()).unwrap();

    // the kernel owns the active table; a running handler elsewhere looks
    // exactly like this
    fx.kernel
        .create_block_device("d1", PHYSICAL_BLOCK_SIZE, 256, 1200)
        .unwrap();

    let err = controller.delete("d1").unwrap_err();
    assert!(matches!(err, SbdError::AlreadyStarted(_)));
    assert!(controller.catalog_entry("d1").is_ok());
    assert!(Controller::storage_status(&spec.storage_file).is_ok());
}

#[test]
fn delete_wipes_the_store_so_add_can_run_again() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let spec = fx.spec("d1");

    controller.add(spec.clone()).unwrap();
    controller.delete("d1").unwrap();

    assert!(matches!(
        controller.catalog_entry("d1").unwrap_err(),
        SbdError::NotFound(_)
    ));
    assert!(matches!(
        Controller::storage_status(&spec.storage_file).unwrap_err(),
        SbdError::Uninitialized
    ));

    // the wiped store reads as empty, so the same definition adds cleanly
    controller.add(spec).unwrap();
}

#[test]
fn delete_tolerates_an_uninitialized_backing_store() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let spec = fx.spec("d1");
    controller.add(spec.clone()).unwrap();

    // wreck the store behind the catalog's back
    std::fs::write(&spec.storage_file, b"").unwrap();

    controller.delete("d1").unwrap();
    assert!(controller.catalog_entries().unwrap().is_empty());
}

#[test]
fn start_stop_round_trip() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    controller.add(fx.spec("d1")).unwrap();

    let mut pipeline = Pipeline::new();
    controller
        .start("d1", StartOptions::default(), &mut pipeline)
        .unwrap();

    // validation ran in-process, the simulated child brought the device up
    assert_eq!(fx.host.respawned_devices(), ["d1"]);
    assert!(controller.device_status().unwrap().contains_key("d1"));

    controller.stop("d1").unwrap();
    assert!(controller.device_status().unwrap().is_empty());

    let err = controller.stop("d1").unwrap_err();
    assert!(matches!(err, SbdError::NotRunning(_)));
}

#[test]
fn start_refuses_an_already_active_device() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    controller.add(fx.spec("d1")).unwrap();
    fx.kernel
        .create_block_device("D1", PHYSICAL_BLOCK_SIZE, 256, 1200)
        .unwrap();

    let mut pipeline = Pipeline::new();
    let err = controller
        .start("d1", StartOptions::default(), &mut pipeline)
        .unwrap_err();
    assert!(matches!(err, SbdError::AlreadyStarted(_)));
}

#[test]
fn start_rejects_both_ramdisk_modes_at_once() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let mut pipeline = Pipeline::new();
    let err = controller
        .start(
            "d1",
            StartOptions {
                device_ramdisk: true,
                stree_ramdisk: true,
                ..StartOptions::default()
            },
            &mut pipeline,
        )
        .unwrap_err();
    assert!(matches!(err, SbdError::InvalidParameter(_)));
}

#[test]
fn excluded_entries_are_skipped_by_start_all() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    controller.add(fx.spec("a")).unwrap();
    controller.add(fx.spec("b")).unwrap();
    controller.set_exclude("b", true).unwrap();

    let mut pipeline = Pipeline::new();
    controller.start_all(false, &mut pipeline).unwrap();

    assert_eq!(fx.host.respawned_devices(), ["a"]);
    let active = controller.device_status().unwrap();
    assert!(active.contains_key("a"));
    assert!(!active.contains_key("b"));
}

#[test]
fn batch_start_reports_the_failing_entry_and_starts_the_rest() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    for name in ["a", "b", "c"] {
        controller.add(fx.spec(name)).unwrap();
    }
    // truncate b's backing file behind the catalog's back
    std::fs::write(fx.spec("b").storage_file, b"").unwrap();

    let mut pipeline = Pipeline::new();
    let err = controller.start_all(false, &mut pipeline).unwrap_err();
    match err {
        SbdError::BatchFailed { operation, devices } => {
            assert_eq!(operation, "start");
            assert_eq!(devices, ["b"]);
        }
        other => panic!("expected BatchFailed, got {other:?}"),
    }

    let active = controller.device_status().unwrap();
    assert!(active.contains_key("a"));
    assert!(active.contains_key("c"));
    assert!(!active.contains_key("b"));
}

#[test]
fn stop_all_accumulates_failures() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    controller.add(fx.spec("a")).unwrap();
    fx.kernel
        .create_block_device("a", PHYSICAL_BLOCK_SIZE, 256, 1200)
        .unwrap();
    // active device with no catalog entry: stop fails at the lookup
    fx.kernel
        .create_block_device("ghost", PHYSICAL_BLOCK_SIZE, 256, 1200)
        .unwrap();

    let err = controller.stop_all().unwrap_err();
    match err {
        SbdError::BatchFailed { operation, devices } => {
            assert_eq!(operation, "shut down");
            assert_eq!(devices, ["ghost"]);
        }
        other => panic!("expected BatchFailed, got {other:?}"),
    }
    assert!(!controller.device_status().unwrap().contains_key("a"));
}

#[test]
fn failed_unmount_downgrades_to_success_and_leaves_the_device_up() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let mut spec = fx.spec("d1");
    spec.mount = true;
    spec.mountpoint = "/mnt/d1".to_owned();
    controller.add(spec).unwrap();

    fx.kernel
        .create_block_device("d1", PHYSICAL_BLOCK_SIZE, 256, 1200)
        .unwrap();
    fx.host.mounted.lock().unwrap().push("/mnt/d1".to_owned());
    fx.host.fail_unmount.store(true, Ordering::SeqCst);

    controller.stop("d1").unwrap();
    // the device is intentionally left up so the operator can retry
    assert!(controller.device_status().unwrap().contains_key("d1"));

    fx.host.fail_unmount.store(false, Ordering::SeqCst);
    controller.stop("d1").unwrap();
    assert!(controller.device_status().unwrap().is_empty());
    assert_eq!(*fx.host.unmounts.lock().unwrap(), ["/mnt/d1"]);
}

#[test]
fn destroy_device_is_an_unconditional_kernel_teardown() {
    let fx = Fixture::new();
    let controller = fx.controller();
    fx.kernel
        .create_block_device("stray", PHYSICAL_BLOCK_SIZE, 256, 1200)
        .unwrap();

    controller.destroy_device("stray").unwrap();
    assert!(controller.device_status().unwrap().is_empty());

    let err = controller.destroy_device("stray").unwrap_err();
    assert!(matches!(err, SbdError::Kernel { errno, .. } if errno == libc_enoent()));

    fx.kernel
        .create_block_device("x", PHYSICAL_BLOCK_SIZE, 256, 1200)
        .unwrap();
    fx.kernel
        .create_block_device("y", PHYSICAL_BLOCK_SIZE, 256, 1200)
        .unwrap();
    controller.destroy_all_devices().unwrap();
    assert!(controller.device_status().unwrap().is_empty());
}

fn libc_enoent() -> i32 {
    SbdError::NotFound(String::new()).to_errno()
}

#[test]
fn daemon_mode_services_io_through_pipeline_and_tree() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let mut spec = fx.spec("d1");
    spec.mount = true;
    spec.mountpoint = "/mnt/d1".to_owned();
    controller.add(spec.clone()).unwrap();

    let kernel = fx.kernel.clone();
    let host = Arc::clone(&fx.host);
    let catalog_path = fx.catalog_path();
    let worker = std::thread::spawn(move || {
        let mut controller = Controller::new(
            catalog_path,
            Arc::new(kernel),
            host as Arc<dyn HostSystem>,
        );
        let mut pipeline: Pipeline = vec![Box::new(XorStage(0x5a))];
        controller.start(
            "d1",
            StartOptions {
                daemon: true,
                ..StartOptions::default()
            },
            &mut pipeline,
        )
    });

    wait_until("device to come up", || {
        fx.kernel
            .device_status_map()
            .map(|m| m.contains_key("d1"))
            .unwrap_or(false)
    });

    // the detached mount worker fires once the device exists
    wait_until("mount worker", || !fx.host.mounts.lock().unwrap().is_empty());
    assert_eq!(
        fx.host.mounts.lock().unwrap()[0],
        ("/dev/d1".to_owned(), "/mnt/d1".to_owned())
    );

    let payload = vec![0xC3_u8; 4096];
    fx.kernel
        .submit_write("d1", 8192, payload.clone())
        .unwrap()
        .recv()
        .unwrap()
        .unwrap();
    let back = fx
        .kernel
        .submit_read("d1", 8192, 4096)
        .unwrap()
        .recv()
        .unwrap()
        .unwrap();
    assert_eq!(back, payload);

    // external destroy ends the callback loop; the handler exits cleanly
    fx.kernel.destroy_block_device_by_name("d1").unwrap();
    worker.join().unwrap().unwrap();

    // the store went through a clean shutdown
    let header = Controller::storage_status(&spec.storage_file).unwrap();
    assert_eq!(header.dirty, 0);

    // and the bytes on disk are pipeline-encoded, not plaintext
    let mut reread = controller.catalog_entry("d1").unwrap();
    let mut stree = Stree::from_spec(
        &mut reread,
        StreeBacking::File {
            path: spec.storage_file.clone().into(),
            io_path: IoPath::buffered(),
        },
    )
    .unwrap();
    stree.startup(false).unwrap();
    let stored = stree.read_entry(2).unwrap().unwrap();
    assert_eq!(stored.len(), 4096);
    assert_ne!(stored, payload);
    let decoded: Vec<u8> = stored.iter().map(|b| b ^ 0x5a).collect();
    assert_eq!(decoded, payload);
    stree.dispose().unwrap();
}

#[test]
fn daemon_mode_with_device_ramdisk_touches_no_disk() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let spec = fx.spec("r1");
    controller.add(spec.clone()).unwrap();
    let before = std::fs::metadata(&spec.storage_file).unwrap().modified().unwrap();

    let kernel = fx.kernel.clone();
    let host = Arc::clone(&fx.host);
    let catalog_path = fx.catalog_path();
    let worker = std::thread::spawn(move || {
        let mut controller = Controller::new(
            catalog_path,
            Arc::new(kernel),
            host as Arc<dyn HostSystem>,
        );
        let mut pipeline = Pipeline::new();
        controller.start(
            "r1",
            StartOptions {
                daemon: true,
                device_ramdisk: true,
                ..StartOptions::default()
            },
            &mut pipeline,
        )
    });

    wait_until("ramdisk device", || {
        fx.kernel
            .device_status_map()
            .map(|m| m.contains_key("r1"))
            .unwrap_or(false)
    });

    fx.kernel
        .submit_write("r1", 0, vec![1_u8; 4096])
        .unwrap()
        .recv()
        .unwrap()
        .unwrap();
    assert_eq!(
        fx.kernel
            .submit_read("r1", 0, 4096)
            .unwrap()
            .recv()
            .unwrap()
            .unwrap(),
        vec![1_u8; 4096]
    );

    fx.kernel.destroy_block_device_by_name("r1").unwrap();
    worker.join().unwrap().unwrap();

    let after = std::fs::metadata(&spec.storage_file).unwrap().modified().unwrap();
    assert_eq!(before, after);
}

#[test]
fn catalog_round_trips_after_add_delete_add() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    let spec = fx.spec("cycle");

    controller.add(spec.clone()).unwrap();
    controller.delete("cycle").unwrap();
    controller.add(spec).unwrap();

    let entry = controller.catalog_entry("cycle").unwrap();
    assert_eq!(entry.device_name, "cycle");
}

#[test]
fn diag_dumps_read_headers_off_the_disk() {
    let fx = Fixture::new();
    let mut controller = fx.controller();
    controller.add(fx.spec("d1")).unwrap();

    let dump = controller.dump_header("d1").unwrap();
    assert!(dump.fields["0001_magic"].starts_with("0x"));
    assert!(dump.fields["0009_dirty"].starts_with('0'));
    assert!(!dump.raw.is_empty());

    // slot 0 parsed as a node is legal; it is just the header bytes
    let node = controller.dump_node_header("d1", 0).unwrap();
    assert!(node.fields.contains_key("0001_parent_block_num"));

    // the block dump is a documented no-op
    controller.dump_block("d1", 0).unwrap();

    let err = controller.dump_header("ghost").unwrap_err();
    assert!(matches!(err, SbdError::NotFound(_)));
}
