//! sbd — define a catalog of virtual block devices backed by an STree
//! object store, and start and stop them against the zosbd2 kernel shim.

mod config;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use config::Config;
use sbd_control::{Controller, Host, HostSystem, Pipeline, StartOptions};
use sbd_error::SbdError;
use sbd_kmod::{ControlChannel, KernelControl};
use sbd_types::{DEFAULT_NODE_VALUE_SIZE, DeviceSpec};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "sbd",
    about = "sbd creates a block device backed by a file or a block device.",
    long_about = "sbd lets you define a catalog of block devices, declaring their size and \
                  backing store, and easily start up and shut down those block devices. \
                  Requires the zosbd2 kernel module."
)]
struct Cli {
    /// configuration file
    #[arg(short = 'c', long, global = true)]
    config_file: Option<PathBuf>,

    /// log file
    #[arg(short = 'l', long, global = true)]
    log_file: Option<PathBuf>,

    /// log level: 0=debug 200=info 500=error
    #[arg(short = 'v', long, global = true)]
    log_level: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Display status of all active block devices.
    DeviceStatus,
    /// Display the layout of a backing store.
    StorageStatus {
        /// path of file or block device for backing storage
        #[arg(short = 't', long)]
        storage_file: String,
    },
    /// Emergency teardown: hang up on the handler of one block device.
    DestroyDevice {
        /// name of the block device to destroy
        #[arg(short = 'd', long)]
        device_name: String,
    },
    /// Emergency teardown of every active block device.
    DestroyAllDevices,
    /// Work with the block device catalog.
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    /// Diagnostic tools.
    Diag {
        #[command(subcommand)]
        command: DiagCommand,
    },
}

#[derive(Subcommand)]
enum CatalogCommand {
    /// List one or all of the devices defined in the catalog.
    List {
        /// name of the block device to display
        #[arg(short = 'd', long)]
        device_name: Option<String>,
    },
    /// Add a catalog entry and initialize its backing store.
    Add {
        /// name of the block device to create
        #[arg(short = 'd', long)]
        device_name: String,
        /// path of file or block device for backing storage
        #[arg(short = 't', long)]
        storage_file: String,
        /// size in bytes of the block device, must be a multiple of 4096
        #[arg(short = 's', long)]
        device_size: u64,
        /// use O_DIRECT when reading and writing backing storage
        #[arg(short = 'i', long)]
        directio: bool,
        /// use O_SYNC when writing to backing storage
        #[arg(short = 'n', long)]
        sync: bool,
        /// align all backing storage writes to this byte alignment
        #[arg(short = 'a', long, default_value_t = 0)]
        alignment: u32,
        /// how many bytes to store in a data node
        #[arg(short = 'e', long, default_value_t = DEFAULT_NODE_VALUE_SIZE)]
        node_value_size: u32,
        /// how many additional nodes make up a single tree block
        #[arg(short = 'p', long, default_value_t = 0)]
        additional_nodes_per_block: u32,
        /// try to mount a filesystem after starting the block device
        #[arg(short = 'm', long)]
        mount: bool,
        /// where to mount the filesystem
        #[arg(short = 'r', long, default_value = "")]
        mountpoint: String,
    },
    /// Permanently destroy a device's data and remove it from the catalog.
    Delete {
        /// name of the block device to delete
        #[arg(short = 'd', long)]
        device_name: String,
        #[arg(long = "I")]
        i: bool,
        #[arg(long = "Am")]
        am: bool,
        #[arg(long = "Sure")]
        sure: bool,
    },
    /// Create a block device from its catalog definition.
    Start {
        /// name of the block device in the catalog to start
        #[arg(short = 'd', long)]
        device_name: Option<String>,
        /// start all devices in the catalog not excluded from starting
        #[arg(short = 'a', long)]
        all: bool,
        /// bring the backing store up even if not cleanly shut down
        #[arg(short = 'f', long)]
        force: bool,
        /// for testing, use a ramdisk to back the block device
        #[arg(short = 'y', long)]
        device_ramdisk: bool,
        /// for testing, use a ramdisk to back the stree
        #[arg(short = 'j', long)]
        stree_ramdisk: bool,
        #[arg(short = 'H', long, hide = true)]
        here_be_dragons: bool,
    },
    /// Cleanly shut down a running block device.
    Stop {
        /// name of the block device in the catalog to stop
        #[arg(short = 'd', long)]
        device_name: Option<String>,
        /// stop all active devices
        #[arg(short = 'a', long)]
        all: bool,
    },
    /// Set a catalog entry option.
    Set {
        #[command(subcommand)]
        command: SetCommand,
    },
}

#[derive(Subcommand)]
enum SetCommand {
    /// Include a catalog entry in catalog start --all.
    Include {
        /// name of the block device to set include on
        #[arg(short = 'd', long)]
        device_name: String,
    },
    /// Exclude a catalog entry from catalog start --all.
    Exclude {
        /// name of the block device to set exclude on
        #[arg(short = 'd', long)]
        device_name: String,
    },
}

#[derive(Subcommand)]
enum DiagCommand {
    /// Dump selected on-disk content.
    Dump {
        #[command(subcommand)]
        command: DumpCommand,
    },
}

#[derive(Subcommand)]
enum DumpCommand {
    /// Pretty print the contents of the backing store header.
    Header {
        /// name of the block device to dump the header of
        #[arg(short = 'd', long)]
        device_name: String,
    },
    /// Dump the header of the block at the given index.
    Blockheader {
        /// name of the block device to dump from
        #[arg(short = 'd', long)]
        device_name: String,
        block_index: u32,
    },
    /// Dump the contents of the block at the given index.
    Block {
        /// name of the block device to dump from
        #[arg(short = 'd', long)]
        device_name: String,
        block_index: u32,
    },
}

// ── main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        error!(target: "sbd", error = %err, "command failed");
        eprintln!("error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<SbdError>()
        .map_or(1, |sbd| sbd.to_errno().clamp(1, 125))
}

fn check_requirements() -> Result<()> {
    // SAFETY: getuid(2) has no arguments and cannot fail.
    let uid = unsafe { libc::getuid() };
    if uid != 0 {
        bail!("you must be root to run sbd");
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config_file.as_deref());

    let daemon_child = matches!(
        cli.command,
        Command::Catalog {
            command: CatalogCommand::Start {
                here_be_dragons: true,
                ..
            }
        }
    );
    config.init_logging(cli.log_level, cli.log_file.as_deref(), daemon_child);

    check_requirements()?;

    let control: Arc<dyn ControlChannel> = Arc::new(KernelControl::new(&config.control_device));
    let host: Arc<dyn HostSystem> = Arc::new(Host);
    let mut controller = Controller::new(&config.catalog_file, control, host);

    match cli.command {
        Command::DeviceStatus => {
            let map = controller.device_status()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&map).context("serialize device status")?
            );
            Ok(())
        }
        Command::StorageStatus { storage_file } => {
            let header = Controller::storage_status(&storage_file)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&header).context("serialize storage status")?
            );
            Ok(())
        }
        Command::DestroyDevice { device_name } => {
            controller.destroy_device(&device_name)?;
            Ok(())
        }
        Command::DestroyAllDevices => {
            controller.destroy_all_devices()?;
            Ok(())
        }
        Command::Catalog { command } => run_catalog(&mut controller, command),
        Command::Diag { command } => run_diag(&mut controller, command),
    }
}

fn run_catalog(controller: &mut Controller, command: CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::List { device_name } => {
            let json = match device_name {
                Some(name) => serde_json::to_string_pretty(&controller.catalog_entry(&name)?),
                None => serde_json::to_string_pretty(&controller.catalog_entries()?),
            }
            .context("serialize catalog entries")?;
            println!("{json}");
            Ok(())
        }
        CatalogCommand::Add {
            device_name,
            storage_file,
            device_size,
            directio,
            sync,
            alignment,
            node_value_size,
            additional_nodes_per_block,
            mount,
            mountpoint,
        } => {
            let spec = DeviceSpec {
                device_name,
                size: device_size,
                storage_file,
                directio,
                sync,
                alignment,
                node_value_size,
                // always calculated, never supplied
                node_calculated_size: 0,
                additional_nodes_per_block,
                mount,
                mountpoint,
                exclude_from_start_all: false,
            };
            controller.add(spec)?;
            Ok(())
        }
        CatalogCommand::Delete {
            device_name,
            i,
            am,
            sure,
        } => {
            require_confirmation(i, am, sure)?;
            controller.delete(&device_name)?;
            Ok(())
        }
        CatalogCommand::Start {
            device_name,
            all,
            force,
            device_ramdisk,
            stree_ramdisk,
            here_be_dragons,
        } => {
            if device_ramdisk && stree_ramdisk {
                bail!("you can only select one of device-ramdisk and stree-ramdisk");
            }
            if device_name.is_some() && all {
                bail!("you can only select one of device name and all");
            }
            let mut pipeline = Pipeline::new();
            match device_name {
                Some(name) => {
                    let options = StartOptions {
                        force,
                        device_ramdisk,
                        stree_ramdisk,
                        daemon: here_be_dragons,
                    };
                    controller.start(&name, options, &mut pipeline)?;
                }
                None if all => controller.start_all(force, &mut pipeline)?,
                None => bail!("you must select one of device name and all"),
            }
            Ok(())
        }
        CatalogCommand::Stop { device_name, all } => {
            if device_name.is_some() && all {
                bail!("you can only select one of device name and all");
            }
            match device_name {
                Some(name) => controller.stop(&name)?,
                None if all => controller.stop_all()?,
                None => bail!("you must select one of device name and all"),
            }
            Ok(())
        }
        CatalogCommand::Set { command } => {
            match command {
                SetCommand::Include { device_name } => {
                    controller.set_exclude(&device_name, false)?;
                }
                SetCommand::Exclude { device_name } => {
                    controller.set_exclude(&device_name, true)?;
                }
            }
            Ok(())
        }
    }
}

/// Deleting a device destroys its data; all three flags must be spelled out.
fn require_confirmation(i: bool, am: bool, sure: bool) -> Result<()> {
    if !(i && am && sure) {
        bail!("deleting a catalog entry destroys its data; pass --I --Am --Sure to confirm");
    }
    Ok(())
}

fn run_diag(controller: &mut Controller, command: DiagCommand) -> Result<()> {
    let DiagCommand::Dump { command } = command;
    match command {
        DumpCommand::Header { device_name } => {
            let dump = controller.dump_header(&device_name)?;
            print!("{}", dump.raw);
            println!(
                "{}",
                serde_json::to_string_pretty(&dump.fields).context("serialize header dump")?
            );
            Ok(())
        }
        DumpCommand::Blockheader {
            device_name,
            block_index,
        } => {
            let dump = controller.dump_node_header(&device_name, block_index)?;
            print!("{}", dump.raw);
            println!(
                "{}",
                serde_json::to_string_pretty(&dump.fields).context("serialize block header dump")?
            );
            Ok(())
        }
        DumpCommand::Block {
            device_name,
            block_index,
        } => {
            controller.dump_block(&device_name, block_index)?;
            Ok(())
        }
    }
}
