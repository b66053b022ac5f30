// Shared types

//! Shared data structures
//!
//! Configuration structures for the engine's own TOML file, the network
//! interface model shared by the network, bridge and reconfiguration code,
//! and small enums describing the device.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reconfiguration state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigState {
    /// Accepted, nothing touched yet
    Requested,
    /// Services stopped, interface taken down
    InterfaceDown,
    /// Writing new config / firewall script
    Reconfiguring,
    /// Interface and services coming back
    InterfaceUp,
    /// Sequence finished (possibly with logged failures)
    Done,
}

/// How an interface obtains its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    /// Address leased from a DHCP server
    #[default]
    Dhcp,
    /// Fixed address from the interfaces file
    Static,
}

/// Addressing of one network interface
///
/// For DHCP every text field is empty. For static addressing `gateway` and
/// `nameserver` may be empty; `broadcast` is derived when written.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkInterfaceConfig {
    /// Addressing method
    pub mode: AddressMode,
    /// Dotted-quad address
    #[serde(default)]
    pub address: String,
    /// Dotted-quad netmask
    #[serde(default)]
    pub netmask: String,
    /// Broadcast address
    #[serde(default)]
    pub broadcast: String,
    /// Default gateway, empty for none
    #[serde(default)]
    pub gateway: String,
    /// First nameserver, empty for none
    #[serde(default)]
    pub nameserver: String,
}

impl NetworkInterfaceConfig {
    /// DHCP config with every text field empty
    pub fn dhcp() -> Self {
        Self::default()
    }

    /// True for DHCP addressing
    pub fn is_dhcp(&self) -> bool {
        self.mode == AddressMode::Dhcp
    }
}

/// Known device models
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Product {
    /// Armadillo-220
    Armadillo220,
    /// Armadillo-230, the only model with a bridge
    Armadillo230,
    /// Armadillo-240
    Armadillo240,
    /// Armadillo-9, no status LED
    Armadillo9,
    /// Unrecognized product name
    Other(String),
}

impl Product {
    /// Model for a `PRODUCT_NAME` value
    pub fn from_name(name: &str) -> Self {
        match name {
            "Armadillo-220" => Product::Armadillo220,
            "Armadillo-230" => Product::Armadillo230,
            "Armadillo-240" => Product::Armadillo240,
            "Armadillo-9" => Product::Armadillo9,
            other => Product::Other(other.to_string()),
        }
    }

    /// Name as written in the settings file
    pub fn name(&self) -> &str {
        match self {
            Product::Armadillo220 => "Armadillo-220",
            Product::Armadillo230 => "Armadillo-230",
            Product::Armadillo240 => "Armadillo-240",
            Product::Armadillo9 => "Armadillo-9",
            Product::Other(name) => name,
        }
    }

    /// Armadillo-9 has no controllable status LED
    pub fn has_status_led(&self) -> bool {
        *self != Product::Armadillo9
    }
}

/// Flash partition targeted by a firmware update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashRegion {
    /// Root filesystem image
    Userland,
    /// Kernel image
    Kernel,
}

impl FlashRegion {
    /// Flash device node of the region
    pub fn device(&self) -> &'static str {
        match self {
            FlashRegion::Userland => "/dev/flash/userland",
            FlashRegion::Kernel => "/dev/flash/kernel",
        }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// `[general]` section
    #[serde(default)]
    pub general: GeneralConfig,
    /// `[paths]` section
    #[serde(default)]
    pub paths: PathsConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// env_logger filter used unless `--log-level` is given
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Every file the engine reads or writes
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PathsConfig {
    /// Flash-backed configuration directory
    pub config_dir: PathBuf,
    /// Debian-style interfaces file
    pub interfaces: PathBuf,
    /// Resolver file holding the nameserver
    pub resolv_conf: PathBuf,
    /// Bridge and STP settings
    pub bridges: PathBuf,
    /// at-admin's own quoted-dialect settings
    pub settings: PathBuf,
    /// Hostname applied with `hostname -F`
    pub hostname: PathBuf,
    /// Hosts file with the `127.0.0.1` line
    pub hosts: PathBuf,
    /// Root crontab reloaded on rollback
    pub crontab: PathBuf,
    /// Committed firewall data store
    pub firewall_store: PathBuf,
    /// Generated iptables script
    pub firewall_script: PathBuf,
    /// Volatile area for flags, staged edits and temp files
    pub work_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/config"),
            interfaces: PathBuf::from("/etc/config/interfaces"),
            resolv_conf: PathBuf::from("/etc/config/resolv.conf"),
            bridges: PathBuf::from("/etc/config/bridges"),
            settings: PathBuf::from("/etc/config/at-admin"),
            hostname: PathBuf::from("/etc/config/HOSTNAME"),
            hosts: PathBuf::from("/etc/config/hosts"),
            crontab: PathBuf::from("/etc/config/root.crontab"),
            firewall_store: PathBuf::from("/etc/config/at-admin-firewall"),
            firewall_script: PathBuf::from("/etc/config/firewall"),
            work_dir: PathBuf::from("/tmp/at-admin"),
        }
    }
}

impl PathsConfig {
    /// Staged firewall store, read in preference to the committed one
    pub fn firewall_staged(&self) -> PathBuf {
        self.work_dir.join("firewall")
    }

    /// Result sentinel written by a failed flash job
    pub fn netflash_result(&self) -> PathBuf {
        self.work_dir.join("netflash-result")
    }

    /// Scratch copy of the config directory used by factory reset
    pub fn config_backup(&self) -> PathBuf {
        self.work_dir.join("config")
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}
