//! Configuration file handling and logging bring-up.
//!
//! The config file is TOML with `[log]`, `[zosbd2]`, and `[catalog]`
//! sections; every field is optional and command-line flags win over the
//! file. A missing config file means defaults; a broken one is reported and
//! then ignored, because an unreadable config must not keep an operator
//! from stopping devices.

use sbd_types::DEFAULT_CONTROL_DEVICE;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/sbd/sbd.conf";
pub const DEFAULT_LOG_FILE: &str = "/var/log/sbd.log";
pub const DEFAULT_CATALOG_FILE: &str = "/etc/sbd/catalog.toml";

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    log: LogSection,
    #[serde(default)]
    zosbd2: Zosbd2Section,
    #[serde(default)]
    catalog: CatalogSection,
}

#[derive(Debug, Default, Deserialize)]
struct LogSection {
    log_file: Option<PathBuf>,
    log_level: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct Zosbd2Section {
    control_device: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogSection {
    catalog_file: Option<PathBuf>,
}

/// Resolved configuration.
#[derive(Debug)]
pub struct Config {
    pub control_device: PathBuf,
    pub catalog_file: PathBuf,
    pub log_file: PathBuf,
    pub log_level: u32,
}

impl Config {
    /// Read the config file (or defaults when absent or broken).
    pub fn load(config_file: Option<&Path>) -> Self {
        let path = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let file: ConfigFile = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).unwrap_or_else(|err| {
                eprintln!("unable to parse config file {}: {err}", path.display());
                ConfigFile::default()
            }),
            Err(_) => ConfigFile::default(),
        };

        Self {
            control_device: file
                .zosbd2
                .control_device
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_DEVICE)),
            catalog_file: file
                .catalog
                .catalog_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_FILE)),
            log_file: file
                .log
                .log_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            log_level: file.log.log_level.unwrap_or(0),
        }
    }

    /// Numeric level mapping: 0=debug 200=info 500=error.
    fn level_directive(level: u32) -> &'static str {
        if level < 200 {
            "debug"
        } else if level < 500 {
            "info"
        } else {
            "error"
        }
    }

    /// Bring up the global tracing subscriber.
    ///
    /// The daemon child has no terminal, so its output always goes to the
    /// log file; interactive commands log to stderr unless a log file was
    /// asked for. `RUST_LOG` overrides the numeric level when set.
    pub fn init_logging(&self, cli_level: Option<u32>, cli_log_file: Option<&Path>, daemon: bool) {
        let level = cli_level.unwrap_or(self.log_level);
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Self::level_directive(level)));

        let log_file = match (cli_log_file, daemon) {
            (Some(path), _) => Some(path.to_path_buf()),
            (None, true) => Some(self.log_file.clone()),
            (None, false) => None,
        };

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false);

        match log_file.and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        }) {
            Some(file) => builder
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init(),
            None => builder.with_writer(std::io::stderr).init(),
        }
    }
}
