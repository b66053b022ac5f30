// Network interface configuration

//! Reading and rewriting the interfaces and resolver files
//!
//! The interfaces file uses Debian-style stanzas. Only the stanza of the
//! interface being edited is touched; every other line is copied through
//! unchanged. The first nameserver lives in a separate resolver file.

use crate::codec;
use crate::error::{NotFound, ValidationError};
use crate::exec::{self, BackgroundJob, CommandRunner, AVAHI, HOSTNAME, SUDO};
use crate::flags::TransactionFlag;
use crate::form::{self, Form};
use crate::store::Store;
use crate::types::{AddressMode, NetworkInterfaceConfig, PathsConfig};
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::Path;

// Form element names
const FIELD_HOSTNAME: &str = "hostname";
const FIELD_ASSIGN_TYPE: &str = "ip_assign_type";
const FIELD_ADDRESS: &str = "ip_address";
const FIELD_NETMASK: &str = "ip_netmask";
const FIELD_GATEWAY: &str = "ip_gateway";
const FIELD_DNS: &str = "ip_dnsserver";
const ASSIGN_DHCP: &str = "dhcp";

/// Gateway value meaning "none"
const NO_GATEWAY: &str = "0.0.0.0";

/// Private and link-local blocks a static address must fall in
const PRIVATE_BLOCKS: [(Ipv4Addr, Ipv4Addr); 4] = [
    (Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 0, 0, 0)),
    (Ipv4Addr::new(172, 16, 0, 0), Ipv4Addr::new(255, 240, 0, 0)),
    (Ipv4Addr::new(192, 168, 0, 0), Ipv4Addr::new(255, 255, 0, 0)),
    (Ipv4Addr::new(169, 254, 0, 0), Ipv4Addr::new(255, 255, 0, 0)),
];

/// Broadcast address: the address with every host bit set
pub fn broadcast(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) | !u32::from(netmask))
}

/// Address lies in a private block, the mask is at least as long as the
/// block's, and the host part is neither all zeros nor all ones
pub fn is_valid_private(address: Ipv4Addr, netmask: Ipv4Addr) -> bool {
    let addr = u32::from(address);
    let mask = u32::from(netmask);

    PRIVATE_BLOCKS.iter().any(|(block, block_mask)| {
        let block_mask = u32::from(*block_mask);
        if addr & block_mask != u32::from(*block) || mask < block_mask {
            return false;
        }
        let host = addr & !mask;
        host != 0 && host != !mask
    })
}

/// True when both addresses share the network part under `netmask`
pub fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, netmask: Ipv4Addr) -> bool {
    let mask = u32::from(netmask);
    u32::from(a) & mask == u32::from(b) & mask
}

/// Broadcast for textual address and netmask, `None` if either is malformed
pub fn broadcast_str(address: &str, netmask: &str) -> Option<String> {
    let address = address.parse().ok()?;
    let netmask = netmask.parse().ok()?;
    Some(broadcast(address, netmask).to_string())
}

fn is_stanza_for(line: &str, iface: &str) -> bool {
    line.starts_with("iface") && line.contains(iface)
}

/// Find the stanza for `iface` in interfaces-file text
///
/// `None` when there is no stanza, or a static stanza lacks an address or a
/// netmask. The nameserver is not part of this file and is left empty.
pub fn parse_interface(text: &str, iface: &str) -> Option<NetworkInterfaceConfig> {
    let mut lines = text.lines().filter(|l| !l.starts_with('#'));

    loop {
        let line = lines.next()?;
        if !is_stanza_for(line, iface) {
            continue;
        }
        if line.contains("dhcp") {
            return Some(NetworkInterfaceConfig::dhcp());
        }
        if line.contains("static") {
            break;
        }
    }

    let mut config = NetworkInterfaceConfig {
        mode: AddressMode::Static,
        ..Default::default()
    };
    let (mut got_address, mut got_netmask) = (false, false);

    for line in lines {
        if line.is_empty() {
            break;
        }
        let mut words = line.split_whitespace();
        let (Some(key), Some(value)) = (words.next(), words.next()) else {
            continue;
        };
        match key {
            "address" => {
                config.address = value.to_string();
                got_address = true;
            }
            "netmask" => {
                config.netmask = value.to_string();
                got_netmask = true;
            }
            "broadcast" => config.broadcast = value.to_string(),
            "gateway" if value != NO_GATEWAY => config.gateway = value.to_string(),
            _ => {}
        }
    }

    (got_address && got_netmask).then_some(config)
}

/// First `nameserver` entry of resolver-file text, empty when there is none
pub fn parse_nameserver(text: &str) -> String {
    text.lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.strip_prefix("nameserver"))
        .find_map(|rest| rest.split_whitespace().next())
        .unwrap_or_default()
        .to_string()
}

/// Current configuration of `iface`, including the first nameserver
pub fn get_current(paths: &PathsConfig, iface: &str) -> Result<NetworkInterfaceConfig> {
    let text = read_required(&paths.interfaces)?;
    let mut config = parse_interface(&text, iface)
        .with_context(|| format!("No usable configuration for {}", iface))?;

    if !config.is_dhcp() {
        config.nameserver = codec::read_optional(&paths.resolv_conf)?
            .map(|text| parse_nameserver(&text))
            .unwrap_or_default();
    }
    Ok(config)
}

fn read_required(path: &Path) -> Result<String> {
    codec::read_optional(path)?.ok_or_else(|| NotFound(path.to_path_buf()).into())
}

/// Stanza text for `iface`; broadcast must already be filled in
pub fn render_stanza(iface: &str, config: &NetworkInterfaceConfig) -> String {
    if config.is_dhcp() {
        return format!("iface {} inet dhcp\n\n", iface);
    }

    let mut out = format!(
        "iface {} inet static\naddress {}\nnetmask {}\nbroadcast {}\n",
        iface, config.address, config.netmask, config.broadcast
    );
    let gateway = if config.gateway.is_empty() {
        NO_GATEWAY
    } else {
        config.gateway.as_str()
    };
    // A blank line ends the stanza
    out.push_str(&format!("gateway {}\n\n", gateway));
    out
}

/// Replace the stanza of `iface` in interfaces-file text, or append one
///
/// Old stanza lines are dropped up to and including the first blank line or
/// the next line mentioning the interface. A following `auto`/`iface` line
/// also ends the old stanza and is kept.
pub fn rewrite_interfaces(text: &str, iface: &str, config: &NetworkInterfaceConfig) -> String {
    let stanza = render_stanza(iface, config);
    let mut out = String::with_capacity(text.len() + stanza.len());
    let mut replaced = false;
    let mut lines = text.split_inclusive('\n').peekable();

    while let Some(line) = lines.next() {
        if !is_stanza_for(line, iface) {
            out.push_str(line);
            continue;
        }

        out.push_str(&stanza);
        replaced = true;
        while let Some(next) = lines.peek() {
            if next.contains(iface) || next.starts_with('\n') {
                lines.next();
                break;
            }
            if next.starts_with("auto ") || next.starts_with("iface ") {
                break;
            }
            lines.next();
        }
    }

    if !replaced {
        out.push_str(&format!("\nauto {}\n", iface));
        out.push_str(&stanza);
    }
    out
}

/// Resolver file content for `nameserver`, empty when there is none
pub fn render_resolv(nameserver: &str) -> String {
    if nameserver.is_empty() {
        String::new()
    } else {
        format!("search local-network\nnameserver {}\n", nameserver)
    }
}

/// Persist `config` as the stanza of `iface` and rewrite the resolver file
pub async fn save(
    runner: &dyn CommandRunner,
    paths: &PathsConfig,
    iface: &str,
    config: &NetworkInterfaceConfig,
) -> Result<()> {
    let mut config = config.clone();
    if !config.is_dhcp() && config.broadcast.is_empty() {
        if let Some(bcast) = broadcast_str(&config.address, &config.netmask) {
            config.broadcast = bcast;
        }
    }

    let text = read_required(&paths.interfaces)?;
    let updated = rewrite_interfaces(&text, iface, &config);
    codec::publish(runner, &paths.work_dir, &paths.interfaces, &updated)
        .await
        .context("Failed to save network interfaces")?;

    codec::publish(
        runner,
        &paths.work_dir,
        &paths.resolv_conf,
        &render_resolv(&config.nameserver),
    )
    .await
    .context("Failed to save nameserver")?;

    log::info!("Saved network configuration for {}", iface);
    Ok(())
}

/// True when `new` differs from `current` in a way that needs a restart
pub fn is_changed(current: &NetworkInterfaceConfig, new: &NetworkInterfaceConfig) -> bool {
    if current.is_dhcp() && new.is_dhcp() {
        return false;
    }
    !(current.address == new.address
        && current.netmask == new.netmask
        && current.gateway == new.gateway
        && current.nameserver == new.nameserver)
}

/// Letters, digits, `-` and `.`
pub fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Validated network settings submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    /// Validated addressing
    pub config: NetworkInterfaceConfig,
    /// Requested hostname
    pub hostname: String,
}

fn parse_addr(value: &str, field: &'static str, message: &str) -> Result<Ipv4Addr, ValidationError> {
    value
        .parse()
        .map_err(|_| ValidationError::new(field, message))
}

/// Validate the network settings form
pub fn parse_form(form: &Form) -> Result<NetworkRequest, ValidationError> {
    if form.is_blank(FIELD_ASSIGN_TYPE) {
        return Err(ValidationError::new(FIELD_ASSIGN_TYPE, "Invalid request"));
    }

    let config = if form.text(FIELD_ASSIGN_TYPE) == ASSIGN_DHCP {
        NetworkInterfaceConfig::dhcp()
    } else {
        if form.is_blank(FIELD_ADDRESS) {
            return Err(ValidationError::new(FIELD_ADDRESS, "Please enter an IP address"));
        }
        if form.is_blank(FIELD_NETMASK) {
            return Err(ValidationError::new(FIELD_NETMASK, "Please enter a netmask"));
        }

        let address_text = form.text(FIELD_ADDRESS);
        let netmask_text = form.text(FIELD_NETMASK);
        let gateway = form.text(FIELD_GATEWAY);
        let nameserver = form.text(FIELD_DNS);

        let address = parse_addr(&address_text, FIELD_ADDRESS, "The entered IP address is not valid")?;
        let netmask = parse_addr(&netmask_text, FIELD_NETMASK, "The entered netmask is not valid")?;

        if !is_valid_private(address, netmask) {
            return Err(ValidationError::new(
                FIELD_ADDRESS,
                "Please enter a valid private network address and netmask combination",
            ));
        }

        if !form::is_blank(&gateway) {
            let gw = parse_addr(&gateway, FIELD_GATEWAY, "The entered gateway is not valid")?;
            if !same_subnet(gw, address, netmask) {
                return Err(ValidationError::new(
                    FIELD_GATEWAY,
                    "IP address and gateway must be on the same network segment",
                ));
            }
        }

        if !form::is_blank(&nameserver) {
            parse_addr(&nameserver, FIELD_DNS, "The entered DNS server address is not valid")?;
        }

        NetworkInterfaceConfig {
            mode: AddressMode::Static,
            address: address_text,
            netmask: netmask_text,
            broadcast: broadcast(address, netmask).to_string(),
            gateway,
            nameserver,
        }
    };

    if form.is_blank(FIELD_HOSTNAME) {
        return Err(ValidationError::new(FIELD_HOSTNAME, "Please enter hostname"));
    }
    let hostname = form.text(FIELD_HOSTNAME);
    if !is_hostname(&hostname) {
        return Err(ValidationError::new(FIELD_HOSTNAME, "Hostname is not valid"));
    }

    Ok(NetworkRequest { config, hostname })
}

/// Rewrite every `127.0.0.1` line of a hosts file for the new name
pub fn rewrite_hosts(text: &str, hostname: &str) -> String {
    text.split_inclusive('\n')
        .map(|line| {
            if line.starts_with("127.0.0.1") {
                format!("127.0.0.1 localhost {}\n", hostname)
            } else {
                line.to_string()
            }
        })
        .collect()
}

async fn current_hostname(runner: &dyn CommandRunner) -> Result<String> {
    let output = exec::exec_checked(runner, &[HOSTNAME])
        .await
        .context("Failed to get hostname")?;
    Ok(output.stdout.trim().to_string())
}

/// Apply a new hostname; returns whether anything changed
pub async fn update_hostname(store: &Store, hostname: &str) -> Result<bool> {
    let runner = store.runner();
    let paths = store.paths();

    if current_hostname(runner).await? == hostname {
        return Ok(false);
    }

    store
        .publish(&paths.hostname, hostname)
        .await
        .context("Failed to write hostname file")?;

    let hostname_file = paths.hostname.to_string_lossy().into_owned();
    exec::sudo(runner, &[HOSTNAME, "-F", hostname_file.as_str()]).await?;

    if let Some(hosts) = codec::read_optional(&paths.hosts)? {
        store
            .publish(&paths.hosts, &rewrite_hosts(&hosts, hostname))
            .await
            .context("Failed to write hosts file")?;
    }

    log::info!("Hostname changed to {}", hostname);
    Ok(true)
}

/// Restart the mDNS responder so it announces the new hostname
pub async fn avahi_restart(runner: &dyn CommandRunner) -> Result<()> {
    exec::exec(runner, &[SUDO, AVAHI, "-k"]).await?;
    exec::exec(runner, &[SUDO, AVAHI, "-D"]).await?;
    Ok(())
}

/// Result of a network settings save
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Neither the interface nor the hostname differed
    Unchanged,
    /// Something was written
    Applied {
        /// Addressing now in the interfaces file
        config: NetworkInterfaceConfig,
        /// The interface was restarted
        interface_changed: bool,
        /// The hostname files were rewritten
        hostname_changed: bool,
    },
}

/// Validate and apply the network settings form
///
/// An interface change is applied by a background restart so the response
/// can be delivered before the link drops.
pub async fn save_settings(store: &Store, form: &Form) -> Result<SaveOutcome> {
    let request = parse_form(form)?;
    let settings = store.settings()?;

    let current = get_current(store.paths(), &settings.primary_if)
        .context("Failed to get network info")?;
    let interface_changed = is_changed(&current, &request.config);
    let hostname_changed = update_hostname(store, &request.hostname).await?;

    if !interface_changed && !hostname_changed {
        log::info!("Network settings unchanged");
        return Ok(SaveOutcome::Unchanged);
    }

    if interface_changed {
        store
            .spawn(BackgroundJob::NetworkRestart {
                config: Some(request.config.clone()),
            })
            .context("Failed to update network interfaces")?;
    } else {
        avahi_restart(store.runner())
            .await
            .context("Failed when restarting avahi")?;
    }

    store.flags().set_or_log(TransactionFlag::UnsavedSettings);

    Ok(SaveOutcome::Applied {
        config: request.config,
        interface_changed,
        hostname_changed,
    })
}
