// Ethernet bridge configuration

//! Bridge configuration store
//!
//! The bridge file is a shell fragment sourced by the bridge init script.
//! Numeric fields are kept as text since each may also hold `DEFAULT`,
//! meaning "leave the kernel's value alone".

use crate::codec::{self, ShellDocument};
use crate::error::{NotFound, ValidationError};
use crate::exec::{self, CommandRunner, FLATFSD, IFCONFIG, SUDO};
use crate::firmware::{self, RebootNotice};
use crate::form::{self, Form};
use crate::network;
use crate::store::Store;
use anyhow::{Context, Result};
use std::path::Path;

/// Interface the bridge is created as
pub const BRIDGE_NAME: &str = "br0";

/// Placeholder for "use the kernel default"
pub const DEFAULT: &str = "DEFAULT";

/// Fewest interfaces a bridge may be built from
pub const MIN_BRIDGED_IFACES: usize = 2;

/// Kernel forward delay, used when the stored value is `DEFAULT`
const KERNEL_FORWARD_DELAY_SECS: u64 = 15;

/// Settle time after bringing the bridge up without STP
const NO_STP_SETTLE_SECS: u64 = 15;

// Form element names
const FIELD_ACTIVATE: &str = "activate_bridge";
const FIELD_ENABLE_STP: &str = "enable_stp";
const FIELD_PORT_PREFIX: &str = "port_";

// Inclusive ranges
const AGEING_RANGE: (u64, u64) = (0, 42_000_000);
const BRIDGE_PRIO_RANGE: (u64, u64) = (0, 65535);
const FORWARD_DELAY_RANGE: (u64, u64) = (4, 30);
const HELLO_RANGE: (u64, u64) = (1, 10);
const MAX_AGE_RANGE: (u64, u64) = (6, 40);
const PORT_PRIO_RANGE: (u64, u64) = (0, 63);
const PORT_COST_RANGE: (u64, u64) = (1, 65535);

/// Bridge and STP settings as stored in the bridges file
///
/// Numeric settings stay text so `DEFAULT` and blank survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Whether the bridge is brought up at boot
    pub create_bridge: bool,
    /// Device name of the bridge
    pub bridge_name: String,
    /// MAC address ageing time in seconds
    pub ageing: String,
    /// Interfaces enslaved to the bridge
    pub bridged_ifaces: Vec<String>,
    /// Substrings identifying bridgeable interfaces
    pub iface_matches: Vec<String>,
    /// Spanning tree enabled
    pub stp_on: bool,
    /// STP bridge priority
    pub bridge_prio: String,
    /// STP forwarding delay in seconds
    pub forward_delay: String,
    /// STP hello time in seconds
    pub hello: String,
    /// Garbage collection interval
    pub gc_interval: String,
    /// STP max message age in seconds
    pub max_age: String,
    /// Per-port path cost, in port order
    pub port_costs: Vec<(String, String)>,
    /// Per-port path priority, in port order
    pub port_prios: Vec<(String, String)>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            create_bridge: false,
            bridge_name: BRIDGE_NAME.to_string(),
            ageing: String::new(),
            bridged_ifaces: Vec::new(),
            iface_matches: Vec::new(),
            stp_on: false,
            bridge_prio: String::new(),
            forward_delay: String::new(),
            hello: String::new(),
            gc_interval: String::new(),
            max_age: String::new(),
            port_costs: Vec::new(),
            port_prios: Vec::new(),
        }
    }
}

fn or_default(value: &str) -> &str {
    if value.is_empty() {
        DEFAULT
    } else {
        value
    }
}

impl BridgeConfig {
    /// Parse bridges-file text; unknown keys are ignored
    pub fn parse(text: &str) -> Self {
        let doc = ShellDocument::parse(text);
        let text_of = |key: &str| doc.get(key).unwrap_or_default().to_string();

        let mut config = Self {
            create_bridge: doc.get_flag("CREATE_BRIDGE"),
            bridge_name: text_of("BRIDGE_NAME"),
            ageing: text_of("SETAGEING"),
            bridged_ifaces: doc.get_words("BRIDGED_IFACES"),
            iface_matches: doc.get_words("IFACE_MATCHES"),
            stp_on: doc.get_flag("STP_ON"),
            bridge_prio: text_of("SETBRIDGEPRIO"),
            forward_delay: text_of("SETFD"),
            hello: text_of("SETHELLO"),
            gc_interval: text_of("SETGCINT"),
            max_age: text_of("SETMAXAGE"),
            port_costs: Vec::new(),
            port_prios: Vec::new(),
        };

        for (key, value) in doc.entries() {
            if let Some(port) = key.strip_prefix("SETPATHCOST_") {
                config.port_costs.push((port.to_string(), value.to_string()));
            } else if let Some(port) = key.strip_prefix("SETPATHPRIO_") {
                config.port_prios.push((port.to_string(), value.to_string()));
            }
        }

        config
    }

    /// `None` when the device has no bridge file
    pub fn load(path: &Path) -> Result<Option<Self>> {
        Ok(codec::read_optional(path)?.map(|text| Self::parse(&text)))
    }

    /// Shell fragment with blank values written as `DEFAULT`
    pub fn render(&self) -> String {
        let mut doc = ShellDocument::default();
        doc.set_flag("CREATE_BRIDGE", self.create_bridge);
        doc.push_blank();
        doc.set("BRIDGE_NAME", &self.bridge_name);
        doc.set("SETAGEING", or_default(&self.ageing));
        doc.set_words("BRIDGED_IFACES", &self.bridged_ifaces);
        doc.set_words("IFACE_MATCHES", &self.iface_matches);
        doc.set_flag("STP_ON", self.stp_on);
        doc.set("SETBRIDGEPRIO", or_default(&self.bridge_prio));
        doc.set("SETFD", or_default(&self.forward_delay));
        doc.set("SETHELLO", or_default(&self.hello));
        doc.set("SETGCINT", or_default(&self.gc_interval));
        doc.set("SETMAXAGE", or_default(&self.max_age));
        for (port, cost) in &self.port_costs {
            doc.set(&format!("SETPATHCOST_{}", port), or_default(cost));
        }
        for (port, prio) in &self.port_prios {
            doc.set(&format!("SETPATHPRIO_{}", port), or_default(prio));
        }
        doc.render()
    }

    /// Publish the rendered file to the bridges path
    pub async fn save(&self, store: &Store) -> Result<()> {
        store
            .publish(&store.paths().bridges, &self.render())
            .await
            .context("Failed to update bridges config file")
    }

    /// Forward delay in seconds; `DEFAULT` is the kernel's 15, garbage is 0
    ///
    /// Hand-edited values above the STP maximum are clamped to it.
    pub fn forward_delay_secs(&self) -> u64 {
        if self.forward_delay == DEFAULT {
            KERNEL_FORWARD_DELAY_SECS
        } else {
            self.forward_delay
                .trim()
                .parse::<u64>()
                .map_or(0, |secs| secs.min(FORWARD_DELAY_RANGE.1))
        }
    }

    /// Time for the bridge to start forwarding after it comes up
    pub fn settle_secs(&self) -> u64 {
        if self.stp_on {
            self.forward_delay_secs().saturating_mul(2)
        } else {
            NO_STP_SETTLE_SECS
        }
    }

    /// Apply the bridge settings form
    ///
    /// `live_ifaces` are the interfaces the user could tick. Parsing stops
    /// early when the bridge or STP is switched off, leaving later fields as
    /// loaded.
    pub fn apply_form(&mut self, form: &Form, live_ifaces: &[String]) {
        if form.is_blank(FIELD_ACTIVATE) {
            self.create_bridge = false;
            return;
        }
        self.create_bridge = true;

        self.bridged_ifaces = live_ifaces
            .iter()
            .filter(|iface| !form.is_blank(&format!("{}{}", FIELD_PORT_PREFIX, iface)))
            .cloned()
            .collect();

        self.ageing = auto_or_text(form, "mac_ageing");

        if form.is_blank(FIELD_ENABLE_STP) {
            self.stp_on = false;
            return;
        }
        self.stp_on = true;

        self.bridge_prio = auto_or_text(form, "bridge_prio");
        self.forward_delay = auto_or_text(form, "forwarding");
        self.hello = auto_or_text(form, "hello_time");
        self.max_age = auto_or_text(form, "max_age");

        self.port_costs = self
            .bridged_ifaces
            .iter()
            .map(|iface| {
                let base = format!("{}{}_cost", FIELD_PORT_PREFIX, iface);
                (iface.clone(), auto_or_text(form, &base))
            })
            .collect();
        self.port_prios = self
            .bridged_ifaces
            .iter()
            .map(|iface| {
                let base = format!("{}{}_prio", FIELD_PORT_PREFIX, iface);
                (iface.clone(), auto_or_text(form, &base))
            })
            .collect();
    }

    /// Check the settings a bridge would be created with
    ///
    /// Nothing is checked when the bridge is off, and the STP fields only
    /// when STP is on. Port priorities are checked before port costs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.create_bridge {
            return Ok(());
        }

        if self.bridged_ifaces.len() < MIN_BRIDGED_IFACES {
            return Err(ValidationError::new(
                "bridged_ifaces",
                format!("Please select at least {} interfaces", MIN_BRIDGED_IFACES),
            ));
        }

        check_entry(
            &self.ageing,
            &EntryCheck {
                field: "ageing",
                missing: "Please specify an ageing time".to_string(),
                label: "Ageing time".to_string(),
                range_label: "Ageing time".to_string(),
                range: AGEING_RANGE,
            },
        )?;

        if !self.stp_on {
            return Ok(());
        }

        let stp_checks = [
            (
                &self.bridge_prio,
                "bridge_prio",
                "Please specify a bridge priority",
                "Bridge priority",
                "Bridge priority",
                BRIDGE_PRIO_RANGE,
            ),
            (
                &self.forward_delay,
                "forward_delay",
                "Please specify a forwarding delay",
                "Forwarding delay",
                "Forwarding delay",
                FORWARD_DELAY_RANGE,
            ),
            (
                &self.hello,
                "hello",
                "Please specify a hello time",
                "Hello time",
                "Hello time",
                HELLO_RANGE,
            ),
            (
                &self.max_age,
                "max_age",
                "Please specify a max age",
                "Max age",
                "Max message age",
                MAX_AGE_RANGE,
            ),
        ];
        for (value, field, missing, label, range_label, range) in stp_checks {
            check_entry(
                value,
                &EntryCheck {
                    field,
                    missing: missing.to_string(),
                    label: label.to_string(),
                    range_label: range_label.to_string(),
                    range,
                },
            )?;
        }

        for (port, prio) in &self.port_prios {
            check_entry(
                prio,
                &EntryCheck {
                    field: "port_prio",
                    missing: format!("Please specify a path priority for {}", port),
                    label: format!("Path priority for {}", port),
                    range_label: format!("Path priority for {}", port),
                    range: PORT_PRIO_RANGE,
                },
            )?;
        }

        for (port, cost) in &self.port_costs {
            check_entry(
                cost,
                &EntryCheck {
                    field: "port_cost",
                    missing: format!("Please specify a path cost for {}", port),
                    label: format!("Path cost for {}", port),
                    range_label: format!("Path cost for {}", port),
                    range: PORT_COST_RANGE,
                },
            )?;
        }

        Ok(())
    }
}

/// `DEFAULT` when the `<base>_auto` box is ticked, else the `<base>_text`
/// value, else empty
fn auto_or_text(form: &Form, base: &str) -> String {
    if !form.is_blank(&format!("{}_auto", base)) {
        return DEFAULT.to_string();
    }
    let text_name = format!("{}_text", base);
    if form.is_blank(&text_name) {
        String::new()
    } else {
        form.text(&text_name)
    }
}

struct EntryCheck {
    field: &'static str,
    missing: String,
    label: String,
    range_label: String,
    range: (u64, u64),
}

fn is_number(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

fn check_entry(value: &str, check: &EntryCheck) -> Result<(), ValidationError> {
    if form::is_blank(value) {
        return Err(ValidationError::new(check.field, check.missing.clone()));
    }
    if value == DEFAULT {
        return Ok(());
    }
    if !is_number(value) {
        return Err(ValidationError::new(
            check.field,
            format!("{} must be a number", check.label),
        ));
    }

    let (min, max) = check.range;
    // Too many digits to parse is out of range as well
    let in_range = value.parse::<u64>().is_ok_and(|n| (min..=max).contains(&n));
    if !in_range {
        return Err(ValidationError::new(
            check.field,
            format!(
                "{} must be a value between {} and {}",
                check.range_label, min, max
            ),
        ));
    }
    Ok(())
}

/// Interfaces whose `ifconfig -a` line contains one of `matches`
pub fn parse_interface_list(output: &str, matches: &[String]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();

    for line in output.lines() {
        if !matches.iter().any(|m| line.contains(m.as_str())) {
            continue;
        }
        let name = line.split(' ').next().unwrap_or_default();
        if !name.is_empty() && !found.iter().any(|f| f == name) {
            found.push(name.to_string());
        }
    }

    found
}

/// Live interfaces that may be added to the bridge
///
/// Falls back to the kernel's address list when `ifconfig` cannot be run;
/// that list misses interfaces without an address.
pub async fn list_interfaces(runner: &dyn CommandRunner, matches: &[String]) -> Result<Vec<String>> {
    if matches.is_empty() {
        return Ok(Vec::new());
    }

    match exec::exec_checked(runner, &[SUDO, IFCONFIG, "-a"]).await {
        Ok(output) => Ok(parse_interface_list(&output.stdout, matches)),
        Err(e) => {
            log::warn!("Failed to read ifconfig output, probing interfaces directly: {:#}", e);
            let mut names: Vec<String> = if_addrs::get_if_addrs()
                .context("Failed to get interface addresses")?
                .into_iter()
                .map(|iface| iface.name)
                .filter(|name| matches.iter().any(|m| name.contains(m.as_str())))
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        }
    }
}

/// Move the primary interface's addressing onto or off the bridge
///
/// Enabling copies the primary interface's config to the bridge; disabling
/// copies the bridge's config to the first previously bridged interface.
/// Either way the primary-interface pointer follows.
async fn switch_primary_interface(store: &Store, new: &BridgeConfig, current: &BridgeConfig) -> Result<()> {
    let paths = store.paths();
    let mut settings = store.settings()?;

    let (from, to) = if new.create_bridge {
        (settings.primary_if.clone(), BRIDGE_NAME.to_string())
    } else {
        let first = current
            .bridged_ifaces
            .first()
            .context("No previously bridged interface to move the bridge config to")?;
        (BRIDGE_NAME.to_string(), first.clone())
    };

    log::info!("Moving network configuration from {} to {}", from, to);

    let config = network::get_current(paths, &from).context("Failed to update network config")?;
    network::save(store.runner(), paths, &to, &config)
        .await
        .context("Failed to update network config")?;

    settings.primary_if = to;
    settings
        .save(store.runner(), &paths.work_dir, &paths.settings)
        .await
        .context("Failed to update system config")
}

/// Validate and save the bridge form, commit to flash and reboot
///
/// The notice says how long the device needs to come back.
pub async fn save_settings(store: &Store, form: &Form) -> Result<RebootNotice> {
    let bridges = &store.paths().bridges;
    let current = BridgeConfig::load(bridges)?.ok_or_else(|| NotFound(bridges.clone()))?;

    let live = if form.is_blank(FIELD_ACTIVATE) {
        Vec::new()
    } else {
        list_interfaces(store.runner(), &current.iface_matches).await?
    };

    let mut new = current.clone();
    new.apply_form(form, &live);
    new.validate()?;

    new.save(store).await?;

    if new.create_bridge != current.create_bridge {
        switch_primary_interface(store, &new, &current).await?;
    }

    exec::sudo(store.runner(), &[FLATFSD, "-s"])
        .await
        .context("Failed to save system config")?;

    firmware::reboot(store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_validation;
    use crate::exec::BackgroundJob;
    use crate::store::testing::Fixture;

    const BRIDGES: &str = "#! /bin/sh\n\nCREATE_BRIDGE=0\n\nBRIDGE_NAME=br0\nSETAGEING=DEFAULT\nBRIDGED_IFACES='eth0 eth1'\nIFACE_MATCHES='eth'\nSTP_ON=0\nSETBRIDGEPRIO=DEFAULT\nSETFD=DEFAULT\nSETHELLO=DEFAULT\nSETGCINT=DEFAULT\nSETMAXAGE=DEFAULT\nSETPATHCOST_eth0=DEFAULT\nSETPATHCOST_eth1=DEFAULT\nSETPATHPRIO_eth0=DEFAULT\nSETPATHPRIO_eth1=DEFAULT\n";

    const IFCONFIG_OUTPUT: &str = "eth0      Link encap:Ethernet  HWaddr 00:11:0C:00:00:01\n          inet addr:192.168.10.10\n\neth1      Link encap:Ethernet  HWaddr 00:11:0C:00:00:02\n\nlo        Link encap:Local Loopback\n";

    fn enabled(ifaces: &[&str]) -> BridgeConfig {
        BridgeConfig {
            create_bridge: true,
            ageing: DEFAULT.to_string(),
            bridged_ifaces: ifaces.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn with_stp() -> BridgeConfig {
        let mut config = enabled(&["eth0", "eth1"]);
        config.stp_on = true;
        config.bridge_prio = DEFAULT.to_string();
        config.forward_delay = DEFAULT.to_string();
        config.hello = DEFAULT.to_string();
        config.max_age = DEFAULT.to_string();
        config
    }

    fn message(config: &BridgeConfig) -> String {
        config.validate().unwrap_err().message
    }

    #[test]
    fn test_parse_bridge_file() {
        let config = BridgeConfig::parse(BRIDGES);
        assert!(!config.create_bridge);
        assert_eq!(config.bridge_name, "br0");
        assert_eq!(config.bridged_ifaces, vec!["eth0", "eth1"]);
        assert_eq!(config.iface_matches, vec!["eth"]);
        assert_eq!(config.forward_delay, DEFAULT);
        assert_eq!(
            config.port_costs,
            vec![
                ("eth0".to_string(), DEFAULT.to_string()),
                ("eth1".to_string(), DEFAULT.to_string())
            ]
        );
        assert_eq!(config.port_prios.len(), 2);
    }

    #[test]
    fn test_render_round_trip() {
        let config = BridgeConfig::parse(BRIDGES);
        assert_eq!(config.render(), BRIDGES);
    }

    #[test]
    fn test_render_blank_as_default() {
        let mut config = enabled(&["eth0", "eth1"]);
        config.ageing = String::new();
        config.port_costs = vec![("eth0".to_string(), String::new())];
        let text = config.render();
        assert!(text.starts_with("#! /bin/sh\n\nCREATE_BRIDGE=1\n\nBRIDGE_NAME=br0\n"));
        assert!(text.contains("SETAGEING=DEFAULT\n"));
        assert!(text.contains("SETGCINT=DEFAULT\n"));
        assert!(text.contains("SETPATHCOST_eth0=DEFAULT\n"));
    }

    #[test]
    fn test_load_missing_is_none() {
        assert!(BridgeConfig::load(Path::new("/nonexistent/bridges"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_settle_secs() {
        let mut config = BridgeConfig::parse(BRIDGES);
        assert_eq!(config.settle_secs(), 15);
        config.stp_on = true;
        assert_eq!(config.settle_secs(), 30);
        config.forward_delay = "4".to_string();
        assert_eq!(config.settle_secs(), 8);
    }

    #[test]
    fn test_settle_secs_out_of_range_forward_delay() {
        let mut config = BridgeConfig::parse(BRIDGES);
        config.stp_on = true;
        config.forward_delay = "9223372036854775807".to_string();
        assert_eq!(config.forward_delay_secs(), 30);
        assert_eq!(config.settle_secs(), 60);

        config.forward_delay = "99999999999999999999999".to_string();
        assert_eq!(config.settle_secs(), 0);
    }

    #[test]
    fn test_validate_skips_when_disabled() {
        let config = BridgeConfig {
            ageing: "garbage".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_needs_two_interfaces() {
        assert_eq!(
            message(&enabled(&["eth0"])),
            "Please select at least 2 interfaces"
        );
        assert!(enabled(&["eth0", "eth1"]).validate().is_ok());
    }

    #[test]
    fn test_validate_ageing() {
        let mut config = enabled(&["eth0", "eth1"]);
        config.ageing = String::new();
        assert_eq!(message(&config), "Please specify an ageing time");
        config.ageing = "1h".to_string();
        assert_eq!(message(&config), "Ageing time must be a number");
        config.ageing = "42000001".to_string();
        assert_eq!(
            message(&config),
            "Ageing time must be a value between 0 and 42000000"
        );
        config.ageing = "42000000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_stp_ranges() {
        let mut config = with_stp();
        assert!(config.validate().is_ok());

        config.forward_delay = "3".to_string();
        assert_eq!(
            message(&config),
            "Forwarding delay must be a value between 4 and 30"
        );
        config.forward_delay = "4".to_string();
        assert!(config.validate().is_ok());
        config.forward_delay = "30".to_string();
        assert!(config.validate().is_ok());
        config.forward_delay = "31".to_string();
        assert!(config.validate().is_err());
        config.forward_delay = DEFAULT.to_string();

        config.bridge_prio = "65536".to_string();
        assert_eq!(
            message(&config),
            "Bridge priority must be a value between 0 and 65535"
        );
        config.bridge_prio = "0".to_string();

        config.hello = "0".to_string();
        assert_eq!(message(&config), "Hello time must be a value between 1 and 10");
        config.hello = "x".to_string();
        assert_eq!(message(&config), "Hello time must be a number");
        config.hello = "10".to_string();

        config.max_age = "5".to_string();
        assert_eq!(
            message(&config),
            "Max message age must be a value between 6 and 40"
        );
        config.max_age = "forty".to_string();
        assert_eq!(message(&config), "Max age must be a number");
        config.max_age = String::new();
        assert_eq!(message(&config), "Please specify a max age");
    }

    #[test]
    fn test_validate_stp_fields_ignored_without_stp() {
        let mut config = with_stp();
        config.stp_on = false;
        config.hello = "99".to_string();
        config.port_costs = vec![("eth0".to_string(), "0".to_string())];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ports_priorities_first() {
        let mut config = with_stp();
        config.port_costs = vec![("eth0".to_string(), "0".to_string())];
        config.port_prios = vec![("eth1".to_string(), "64".to_string())];
        assert_eq!(
            message(&config),
            "Path priority for eth1 must be a value between 0 and 63"
        );

        config.port_prios = vec![("eth1".to_string(), "63".to_string())];
        assert_eq!(
            message(&config),
            "Path cost for eth0 must be a value between 1 and 65535"
        );

        config.port_costs = vec![("eth0".to_string(), String::new())];
        assert_eq!(message(&config), "Please specify a path cost for eth0");
        config.port_costs = vec![("eth0".to_string(), "1".to_string())];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_number_out_of_range() {
        let mut config = enabled(&["eth0", "eth1"]);
        config.ageing = "99999999999999999999999".to_string();
        assert_eq!(
            message(&config),
            "Ageing time must be a value between 0 and 42000000"
        );
    }

    #[test]
    fn test_apply_form_disable_stops_early() {
        let mut config = with_stp();
        config.apply_form(&Form::new(), &["eth0".to_string()]);
        assert!(!config.create_bridge);
        // Untouched
        assert!(config.stp_on);
        assert_eq!(config.bridged_ifaces, vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_apply_form_full() {
        let live = vec!["eth0".to_string(), "eth1".to_string(), "eth2".to_string()];
        let form = Form::new()
            .with("activate_bridge", "on")
            .with("port_eth0", "on")
            .with("port_eth2", "on")
            .with("mac_ageing_text", "300\r\n")
            .with("enable_stp", "on")
            .with("bridge_prio_auto", "on")
            .with("bridge_prio_text", "99")
            .with("forwarding_text", "10")
            .with("hello_time_auto", "on")
            .with("max_age_text", "")
            .with("port_eth0_cost_auto", "on")
            .with("port_eth0_prio_text", "5")
            .with("port_eth2_cost_text", "100");

        let mut config = BridgeConfig::default();
        config.apply_form(&form, &live);

        assert!(config.create_bridge);
        assert_eq!(config.bridged_ifaces, vec!["eth0", "eth2"]);
        assert_eq!(config.ageing, "300");
        assert!(config.stp_on);
        assert_eq!(config.bridge_prio, DEFAULT);
        assert_eq!(config.forward_delay, "10");
        assert_eq!(config.hello, DEFAULT);
        assert_eq!(config.max_age, "");
        assert_eq!(
            config.port_costs,
            vec![
                ("eth0".to_string(), DEFAULT.to_string()),
                ("eth2".to_string(), "100".to_string())
            ]
        );
        assert_eq!(
            config.port_prios,
            vec![
                ("eth0".to_string(), "5".to_string()),
                ("eth2".to_string(), String::new())
            ]
        );
    }

    #[test]
    fn test_parse_interface_list() {
        let matches = vec!["eth".to_string()];
        assert_eq!(
            parse_interface_list(IFCONFIG_OUTPUT, &matches),
            vec!["eth0", "eth1"]
        );
        assert!(parse_interface_list(IFCONFIG_OUTPUT, &["wlan".to_string()]).is_empty());
    }

    #[tokio::test]
    async fn test_list_interfaces_uses_ifconfig() {
        let fx = Fixture::new("bridge-list");
        fx.runner
            .respond("/usr/bin/sudo /sbin/ifconfig -a", IFCONFIG_OUTPUT, 0);
        let found = list_interfaces(fx.store.runner(), &["eth".to_string()])
            .await
            .unwrap();
        assert_eq!(found, vec!["eth0", "eth1"]);
    }

    fn bridge_device(name: &str) -> Fixture {
        let fx = Fixture::new(name);
        fx.write(&fx.paths().bridges, BRIDGES);
        fx.write(
            &fx.paths().interfaces,
            "auto lo\niface lo inet loopback\n\nauto eth0\niface eth0 inet static\naddress 192.168.10.10\nnetmask 255.255.255.0\nbroadcast 192.168.10.255\ngateway 192.168.10.1\n\n",
        );
        fx.runner
            .respond("/usr/bin/sudo /sbin/ifconfig -a", IFCONFIG_OUTPUT, 0);
        fx
    }

    #[tokio::test]
    async fn test_save_enables_bridge_end_to_end() {
        let fx = bridge_device("bridge-enable");
        let form = Form::new()
            .with("activate_bridge", "on")
            .with("port_eth0", "on")
            .with("port_eth1", "on")
            .with("mac_ageing_auto", "on")
            .with("enable_stp", "on")
            .with("bridge_prio_auto", "on")
            .with("forwarding_text", "4")
            .with("hello_time_auto", "on")
            .with("max_age_auto", "on")
            .with("port_eth0_cost_auto", "on")
            .with("port_eth0_prio_auto", "on")
            .with("port_eth1_cost_auto", "on")
            .with("port_eth1_prio_auto", "on");

        let notice = save_settings(&fx.store, &form).await.unwrap();
        // Base 40 plus forward delay twice
        assert_eq!(notice.secs, 48);

        let saved = BridgeConfig::load(&fx.paths().bridges).unwrap().unwrap();
        assert!(saved.create_bridge);
        assert!(saved.stp_on);
        assert_eq!(saved.forward_delay, "4");

        // Addressing moved to the bridge and the primary pointer follows
        let br0 = network::get_current(fx.paths(), BRIDGE_NAME).unwrap();
        assert_eq!(br0.address, "192.168.10.10");
        assert_eq!(fx.store.settings().unwrap().primary_if, BRIDGE_NAME);

        assert_eq!(
            fx.runner.calls_starting_with("/usr/bin/sudo /bin/flatfsd"),
            vec!["/usr/bin/sudo /bin/flatfsd -s"]
        );
        assert_eq!(fx.background.jobs(), vec![BackgroundJob::Reboot]);
    }

    #[tokio::test]
    async fn test_save_without_toggle_keeps_primary() {
        let fx = bridge_device("bridge-no-toggle");
        let form = Form::new();

        save_settings(&fx.store, &form).await.unwrap();
        assert_eq!(fx.store.settings().unwrap().primary_if, "eth0");
        assert!(network::get_current(fx.paths(), BRIDGE_NAME).is_err());
        // Interface list is not needed when the bridge stays off
        assert!(fx.runner.calls_starting_with("/usr/bin/sudo /sbin/ifconfig").is_empty());
    }

    #[tokio::test]
    async fn test_save_invalid_writes_nothing() {
        let fx = bridge_device("bridge-invalid");
        let form = Form::new()
            .with("activate_bridge", "on")
            .with("port_eth0", "on")
            .with("mac_ageing_auto", "on");

        let err = save_settings(&fx.store, &form).await.unwrap_err();
        assert_eq!(
            as_validation(&err).unwrap().message,
            "Please select at least 2 interfaces"
        );
        assert_eq!(fx.read(&fx.paths().bridges), BRIDGES);
        assert!(fx.background.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_save_missing_bridge_file() {
        let fx = Fixture::new("bridge-missing");
        let err = save_settings(&fx.store, &Form::new()).await.unwrap_err();
        assert!(err.downcast_ref::<NotFound>().is_some());
    }
}
