// Interface reconfiguration sequence

//! State machine for taking the primary interface down and back up
//!
//! A restart runs in a detached worker: services are stopped and the
//! interface downed, the new addressing and firewall script are written while
//! nothing is listening, then everything is brought back. There is no
//! cancellation; a failing step is logged and the sequence carries on so the
//! device never stays offline.

use crate::bridge::{BridgeConfig, BRIDGE_NAME};
use crate::exec::{self, AVAHI, FIREWALL_INIT, IFCONFIG, IFDOWN, IFUP, LED_CTRL, SNORT_INIT, SUDO};
use crate::network;
use crate::settings::SystemSettings;
use crate::store::Store;
use crate::types::{NetworkInterfaceConfig, Product, ReconfigState};
use std::time::Duration;

/// Delays used by the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Gap between `ifconfig` polls while waiting for the interface to go
    pub poll_interval: Duration,
    /// Give up waiting for the interface after this long
    pub poll_budget: Duration,
    /// Length of one second of bridge settle time
    pub settle_unit: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            poll_budget: Duration::from_secs(3),
            settle_unit: Duration::from_secs(1),
        }
    }
}

/// Commands that trigger state transitions
#[derive(Debug, Clone, Copy)]
pub enum ReconfigCommand {
    /// Start the sequence
    Begin,
    /// Interface taken down (or the wait gave up)
    InterfaceDowned,
    /// Config and firewall script written
    Reconfigured,
    /// Interface and services restarted
    InterfaceUpped,
}

/// Actions to take in response to state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconfigAction {
    /// Stop services and down the interface
    TakeDown,
    /// Persist addressing and run the firewall script
    Reconfigure,
    /// Up the interface and restart services
    BringUp,
    /// No action needed
    None,
}

/// Reconfiguration state machine
pub struct ReconfigMachine {
    state: ReconfigState,
}

impl Default for ReconfigMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconfigMachine {
    /// Machine in the `Requested` state
    pub fn new() -> Self {
        Self {
            state: ReconfigState::Requested,
        }
    }

    /// Handle a command and return the action to take
    pub fn handle_command(&mut self, cmd: ReconfigCommand) -> ReconfigAction {
        log::debug!("State: {:?}, Command: {:?}", self.state, cmd);

        match (self.state, cmd) {
            (ReconfigState::Requested, ReconfigCommand::Begin) => {
                log::info!("Taking interface down for reconfiguration");
                self.state = ReconfigState::InterfaceDown;
                ReconfigAction::TakeDown
            }

            (ReconfigState::InterfaceDown, ReconfigCommand::InterfaceDowned) => {
                self.state = ReconfigState::Reconfiguring;
                ReconfigAction::Reconfigure
            }

            (ReconfigState::Reconfiguring, ReconfigCommand::Reconfigured) => {
                log::info!("Bringing interface back up");
                self.state = ReconfigState::InterfaceUp;
                ReconfigAction::BringUp
            }

            (ReconfigState::InterfaceUp, ReconfigCommand::InterfaceUpped) => {
                log::info!("Reconfiguration finished");
                self.state = ReconfigState::Done;
                ReconfigAction::None
            }

            _ => {
                log::debug!(
                    "No action for state {:?} with command {:?}",
                    self.state,
                    cmd
                );
                ReconfigAction::None
            }
        }
    }

    /// Current state
    pub fn state(&self) -> ReconfigState {
        self.state
    }
}

/// Bridge settle time in wall-clock terms
fn settle_delay(timing: &Timing, secs: u64) -> Duration {
    timing
        .settle_unit
        .saturating_mul(u32::try_from(secs).unwrap_or(u32::MAX))
}

/// How the wait for the interface to disappear ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Interface no longer listed
    Down,
    /// Still listed when the poll budget ran out
    TimedOut,
    /// `ifconfig` could not be run
    Unavailable,
}

/// Summary of one restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigReport {
    /// State the machine ended in
    pub state: ReconfigState,
    /// How the interface-down wait ended; `None` if it never ran
    pub wait: Option<WaitOutcome>,
}

/// Drives one restart of the primary interface
pub struct Orchestrator<'a> {
    store: &'a Store,
    iface: String,
    product: Product,
}

impl<'a> Orchestrator<'a> {
    /// Orchestrator for the primary interface named in `settings`
    pub fn new(store: &'a Store, settings: &SystemSettings) -> Self {
        Self {
            store,
            iface: settings.primary_if.clone(),
            product: settings.product(),
        }
    }

    /// Run the whole sequence, writing `config` for the primary interface
    /// when given
    pub async fn restart(&self, config: Option<&NetworkInterfaceConfig>) -> ReconfigReport {
        let mut machine = ReconfigMachine::new();
        let mut wait = None;
        let mut cmd = ReconfigCommand::Begin;

        loop {
            match machine.handle_command(cmd) {
                ReconfigAction::TakeDown => {
                    wait = Some(self.take_down().await);
                    cmd = ReconfigCommand::InterfaceDowned;
                }
                ReconfigAction::Reconfigure => {
                    self.reconfigure(config).await;
                    cmd = ReconfigCommand::Reconfigured;
                }
                ReconfigAction::BringUp => {
                    self.bring_up().await;
                    cmd = ReconfigCommand::InterfaceUpped;
                }
                ReconfigAction::None => break,
            }
        }

        ReconfigReport {
            state: machine.state(),
            wait,
        }
    }

    async fn take_down(&self) -> WaitOutcome {
        let runner = self.store.runner();
        let iface = self.iface.as_str();

        exec::exec_logged(runner, &[SUDO, SNORT_INIT, "stop", iface]).await;
        if self.product.has_status_led() {
            exec::exec_logged(runner, &[SUDO, LED_CTRL, "--red=on"]).await;
        }
        exec::exec_logged(runner, &[SUDO, AVAHI, "-k"]).await;
        exec::exec_logged(runner, &[SUDO, IFDOWN, iface]).await;

        let outcome = self.wait_interface_down().await;
        match outcome {
            WaitOutcome::Down => log::debug!("{} is down", iface),
            WaitOutcome::TimedOut => log::error!("{} not downed", iface),
            WaitOutcome::Unavailable => log::error!("Failed to read ifconfig output"),
        }
        outcome
    }

    /// Poll `ifconfig` until the interface is no longer listed
    async fn wait_interface_down(&self) -> WaitOutcome {
        let timing = self.store.timing();
        let listed = format!("{} ", self.iface);
        let mut waited = Duration::ZERO;

        while waited < timing.poll_budget {
            match exec::exec(self.store.runner(), &[SUDO, IFCONFIG]).await {
                Ok(output) => {
                    if !output.stdout.contains(&listed) {
                        return WaitOutcome::Down;
                    }
                }
                Err(e) => {
                    log::debug!("ifconfig poll failed: {:#}", e);
                    return WaitOutcome::Unavailable;
                }
            }
            tokio::time::sleep(timing.poll_interval).await;
            waited += timing.poll_interval;
        }

        WaitOutcome::TimedOut
    }

    async fn reconfigure(&self, config: Option<&NetworkInterfaceConfig>) {
        if let Some(config) = config {
            log::info!("Writing new configuration for {}", self.iface);
            if let Err(e) = network::save(self.store.runner(), self.store.paths(), &self.iface, config).await
            {
                log::error!("Couldn't save network info: {:#}", e);
            }
        }

        exec::exec_logged(self.store.runner(), &[SUDO, FIREWALL_INIT]).await;
    }

    async fn bring_up(&self) {
        let runner = self.store.runner();
        let iface = self.iface.as_str();

        match BridgeConfig::load(&self.store.paths().bridges) {
            Ok(Some(bridge)) => {
                let secs = bridge.settle_secs();
                log::info!("Waiting {}s for {} to settle", secs, BRIDGE_NAME);
                exec::exec_logged(runner, &[SUDO, IFCONFIG, BRIDGE_NAME, "0.0.0.0"]).await;
                tokio::time::sleep(settle_delay(self.store.timing(), secs)).await;
            }
            Ok(None) => log::debug!("No bridge config, skipping bridge wait"),
            Err(e) => log::error!("Failed to load bridge info: {:#}", e),
        }

        exec::exec_logged(runner, &[SUDO, IFUP, iface]).await;
        exec::exec_logged(runner, &[SUDO, AVAHI, "-D"]).await;
        if self.product.has_status_led() {
            exec::exec_logged(runner, &[SUDO, LED_CTRL, "--red=off"]).await;
        }
        exec::exec_logged(runner, &[SUDO, SNORT_INIT, "start", iface]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::Fixture;
    use crate::types::AddressMode;

    const INTERFACES: &str = "auto lo\niface lo inet loopback\n\nauto eth0\niface eth0 inet dhcp\n\n";

    #[test]
    fn test_settle_delay_saturates() {
        let timing = Timing::default();
        assert_eq!(settle_delay(&timing, 30), Duration::from_secs(30));
        assert_eq!(
            settle_delay(&timing, u64::MAX),
            Duration::from_secs(u64::from(u32::MAX))
        );
    }

    #[test]
    fn test_initial_state() {
        let machine = ReconfigMachine::new();
        assert_eq!(machine.state(), ReconfigState::Requested);
    }

    #[test]
    fn test_full_sequence() {
        let mut machine = ReconfigMachine::new();

        assert_eq!(
            machine.handle_command(ReconfigCommand::Begin),
            ReconfigAction::TakeDown
        );
        assert_eq!(machine.state(), ReconfigState::InterfaceDown);

        assert_eq!(
            machine.handle_command(ReconfigCommand::InterfaceDowned),
            ReconfigAction::Reconfigure
        );
        assert_eq!(machine.state(), ReconfigState::Reconfiguring);

        assert_eq!(
            machine.handle_command(ReconfigCommand::Reconfigured),
            ReconfigAction::BringUp
        );
        assert_eq!(machine.state(), ReconfigState::InterfaceUp);

        assert_eq!(
            machine.handle_command(ReconfigCommand::InterfaceUpped),
            ReconfigAction::None
        );
        assert_eq!(machine.state(), ReconfigState::Done);
    }

    #[test]
    fn test_out_of_order_commands_ignored() {
        let mut machine = ReconfigMachine::new();
        assert_eq!(
            machine.handle_command(ReconfigCommand::Reconfigured),
            ReconfigAction::None
        );
        assert_eq!(machine.state(), ReconfigState::Requested);

        machine.handle_command(ReconfigCommand::Begin);
        // Begin twice does not restart the sequence
        assert_eq!(
            machine.handle_command(ReconfigCommand::Begin),
            ReconfigAction::None
        );
        assert_eq!(machine.state(), ReconfigState::InterfaceDown);
    }

    #[test]
    fn test_done_is_terminal() {
        let mut machine = ReconfigMachine::new();
        machine.handle_command(ReconfigCommand::Begin);
        machine.handle_command(ReconfigCommand::InterfaceDowned);
        machine.handle_command(ReconfigCommand::Reconfigured);
        machine.handle_command(ReconfigCommand::InterfaceUpped);

        for cmd in [
            ReconfigCommand::Begin,
            ReconfigCommand::InterfaceDowned,
            ReconfigCommand::Reconfigured,
        ] {
            assert_eq!(machine.handle_command(cmd), ReconfigAction::None);
            assert_eq!(machine.state(), ReconfigState::Done);
        }
    }

    #[tokio::test]
    async fn test_restart_command_order() {
        let fx = Fixture::new("reconfig-order");
        fx.write(&fx.paths().interfaces, INTERFACES);

        let settings = fx.store.settings().unwrap();
        let report = Orchestrator::new(&fx.store, &settings).restart(None).await;

        assert_eq!(report.state, ReconfigState::Done);
        assert_eq!(report.wait, Some(WaitOutcome::Down));
        assert_eq!(
            fx.runner.calls(),
            vec![
                "/usr/bin/sudo /etc/init.d/snort stop eth0",
                "/usr/bin/sudo /bin/ledctrl --red=on",
                "/usr/bin/sudo /sbin/avahi-daemon -k",
                "/usr/bin/sudo /sbin/ifdown eth0",
                "/usr/bin/sudo /sbin/ifconfig",
                "/usr/bin/sudo /etc/init.d/firewall",
                "/usr/bin/sudo /sbin/ifup eth0",
                "/usr/bin/sudo /sbin/avahi-daemon -D",
                "/usr/bin/sudo /bin/ledctrl --red=off",
                "/usr/bin/sudo /etc/init.d/snort start eth0",
            ]
        );
        // No config given, interfaces untouched
        assert_eq!(fx.read(&fx.paths().interfaces), INTERFACES);
    }

    #[tokio::test]
    async fn test_restart_writes_config() {
        let fx = Fixture::new("reconfig-write");
        fx.write(&fx.paths().interfaces, INTERFACES);

        let config = NetworkInterfaceConfig {
            mode: AddressMode::Static,
            address: "192.168.10.10".to_string(),
            netmask: "255.255.255.0".to_string(),
            broadcast: String::new(),
            gateway: "192.168.10.1".to_string(),
            nameserver: "192.168.10.1".to_string(),
        };

        let settings = fx.store.settings().unwrap();
        Orchestrator::new(&fx.store, &settings)
            .restart(Some(&config))
            .await;

        let saved = network::get_current(fx.paths(), "eth0").unwrap();
        assert_eq!(saved.address, "192.168.10.10");
        assert_eq!(saved.broadcast, "192.168.10.255");
        assert_eq!(saved.nameserver, "192.168.10.1");
    }

    #[tokio::test]
    async fn test_wait_times_out_and_continues() {
        let fx = Fixture::new("reconfig-timeout");
        fx.write(&fx.paths().interfaces, INTERFACES);
        for _ in 0..10 {
            fx.runner.respond(
                "/usr/bin/sudo /sbin/ifconfig",
                "eth0      Link encap:Ethernet\n",
                0,
            );
        }

        let settings = fx.store.settings().unwrap();
        let report = Orchestrator::new(&fx.store, &settings).restart(None).await;

        assert_eq!(report.wait, Some(WaitOutcome::TimedOut));
        assert_eq!(report.state, ReconfigState::Done);
        assert!(fx.runner.calls().contains(&"/usr/bin/sudo /sbin/ifup eth0".to_string()));
    }

    #[tokio::test]
    async fn test_armadillo9_skips_led() {
        let fx = Fixture::new("reconfig-a9");
        let mut settings = fx.store.settings().unwrap();
        settings.product_name = "Armadillo-9".to_string();

        Orchestrator::new(&fx.store, &settings).restart(None).await;
        assert!(fx.runner.calls_starting_with("/usr/bin/sudo /bin/ledctrl").is_empty());
    }

    #[tokio::test]
    async fn test_bridge_settle_before_ifup() {
        let fx = Fixture::new("reconfig-bridge");
        fx.write(
            &fx.paths().bridges,
            "#! /bin/sh\n\nCREATE_BRIDGE=1\n\nBRIDGE_NAME=br0\nSTP_ON=1\nSETFD=4\n",
        );
        let mut settings = fx.store.settings().unwrap();
        settings.primary_if = BRIDGE_NAME.to_string();

        Orchestrator::new(&fx.store, &settings).restart(None).await;

        let calls = fx.runner.calls();
        let settle = calls
            .iter()
            .position(|c| c == "/usr/bin/sudo /sbin/ifconfig br0 0.0.0.0")
            .unwrap();
        let up = calls
            .iter()
            .position(|c| c == "/usr/bin/sudo /sbin/ifup br0")
            .unwrap();
        assert!(settle < up);
    }
}
