//! Daemon configuration.
//!
//! Settings come from an optional JSON file (`--config ftms_config.json`);
//! command-line flags override whatever the file says.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{Capability, DeviceIdentity, Result};

pub const DEFAULT_DEVICE_ID: u16 = 1;
pub const DEFAULT_TICK_MS: u64 = 1000;
pub const DEFAULT_DEBUG_PORT: u16 = 8828;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Advertised as "M <device_id>"
    pub device_id: u16,
    pub controllable: bool,
    /// Require Request Control before accepting targets
    pub require_control: bool,
    /// Telemetry notification period
    pub tick_ms: u64,
    pub debug_port: u16,
    /// BlueZ adapter name (e.g. "hci0"); default adapter when unset
    pub adapter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID,
            controllable: true,
            require_control: false,
            tick_ms: DEFAULT_TICK_MS,
            debug_port: DEFAULT_DEBUG_PORT,
            adapter: None,
        }
    }
}

impl Config {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity(self.device_id)
    }

    pub fn capability(&self) -> Capability {
        Capability {
            controllable: self.controllable,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Load config from a JSON file. Missing keys take their defaults.
pub fn load(path: &Path) -> Result<Config> {
    let data = std::fs::read_to_string(path)?;
    let cfg: Config = serde_json::from_str(&data)?;
    info!("Loaded config from {}: {:?}", path.display(), cfg);
    Ok(cfg)
}

#[derive(Debug, Parser)]
#[command(name = "ftms-bike")]
#[command(about = "BLE FTMS indoor bike peripheral")]
pub struct Args {
    /// JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Numeric id used in the advertised name
    #[arg(long)]
    pub device_id: Option<u16>,

    /// Expose a read-only trainer (no power/resistance targets)
    #[arg(long)]
    pub not_controllable: bool,

    /// Reject targets until the client sends Request Control
    #[arg(long)]
    pub require_control: bool,

    /// Telemetry notification period in milliseconds
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// TCP port for the debug console
    #[arg(long)]
    pub debug_port: Option<u16>,

    /// BlueZ adapter to use
    #[arg(long)]
    pub adapter: Option<String>,
}

impl Args {
    /// Merge the config file (if any) with command-line overrides.
    pub fn resolve(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => load(path)?,
            None => Config::default(),
        };
        if let Some(id) = self.device_id {
            cfg.device_id = id;
        }
        if self.not_controllable {
            cfg.controllable = false;
        }
        if self.require_control {
            cfg.require_control = true;
        }
        if let Some(ms) = self.tick_ms {
            cfg.tick_ms = ms;
        }
        if let Some(port) = self.debug_port {
            cfg.debug_port = port;
        }
        if self.adapter.is_some() {
            cfg.adapter = self.adapter;
        }
        Ok(cfg)
    }
}
