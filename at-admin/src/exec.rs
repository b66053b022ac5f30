// Command execution and background work

//! External command execution
//!
//! Every OS side effect goes through [`CommandRunner`], which takes a full argv
//! and reports stdout plus exit status. Work that must outlive the current
//! request is handed to a [`Background`] implementation as a serializable
//! [`BackgroundJob`].

use crate::error::ExecError;
use crate::types::{FlashRegion, NetworkInterfaceConfig};
use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

// Tool locations on the device
/// Privilege helper every root action goes through
pub const SUDO: &str = "/usr/bin/sudo";
/// File copy, the only way a config file is published
pub const CP: &str = "/bin/cp";
/// File removal
pub const RM: &str = "/bin/rm";
/// Creates empty sentinel files
pub const TOUCH: &str = "/bin/touch";
/// Brings an interface up
pub const IFUP: &str = "/sbin/ifup";
/// Takes an interface down
pub const IFDOWN: &str = "/sbin/ifdown";
/// Lists interfaces and configures the bridge address
pub const IFCONFIG: &str = "/sbin/ifconfig";
/// Finds running processes by name
pub const PIDOF: &str = "/bin/pidof";
/// Writes firmware images to flash
pub const NETFLASH: &str = "/bin/netflash";
/// Saves, restores and wipes the flash-backed config
pub const FLATFSD: &str = "/bin/flatfsd";
/// mDNS responder
pub const AVAHI: &str = "/sbin/avahi-daemon";
/// Status LED control
pub const LED_CTRL: &str = "/bin/ledctrl";
/// Restarts the device
pub const REBOOT: &str = "/sbin/reboot";
/// Applies the hostname file
pub const HOSTNAME: &str = "/bin/hostname";
/// Installs the root crontab
pub const CRONTAB: &str = "/usr/bin/crontab";
/// Fetches the firmware directory listing
pub const WGET: &str = "wget";
/// Packet scanner init script
pub const SNORT_INIT: &str = "/etc/init.d/snort";
/// Firewall init script, sources the generated rules
pub const FIREWALL_INIT: &str = "/etc/init.d/firewall";

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Everything the command wrote to stdout
    pub stdout: String,
    /// Exit status, `-1` when killed by a signal
    pub code: i32,
}

impl CommandOutput {
    /// True for exit status 0
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs an argv and captures its stdout and exit status
///
/// A non-zero exit is not an error at this level; callers decide. An `Err`
/// means the command could not be run at all.
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion, capturing stdout
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, Result<CommandOutput>>;
}

/// Runner backed by real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            let (program, args) = argv.split_first().context("Empty command line")?;
            log::debug!("exec: {}", argv.join(" "));

            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .output()
                .await
                .with_context(|| format!("Failed to execute {}", program))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                log::debug!("{} failed: {}", program, stderr.trim_end());
            }

            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                // Killed by a signal has no code
                code: output.status.code().unwrap_or(-1),
            })
        })
    }
}

fn to_argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Run a command, returning its output whatever the exit status
pub async fn exec(runner: &dyn CommandRunner, parts: &[&str]) -> Result<CommandOutput> {
    let argv = to_argv(parts);
    runner.run(&argv).await
}

/// Run a command and fail on non-zero exit
pub async fn exec_checked(runner: &dyn CommandRunner, parts: &[&str]) -> Result<CommandOutput> {
    let output = exec(runner, parts).await?;
    if !output.success() {
        return Err(ExecError {
            program: parts.first().copied().unwrap_or_default().to_string(),
            code: output.code,
        }
        .into());
    }
    Ok(output)
}

/// Run a command through the privilege helper and fail on non-zero exit
pub async fn sudo(runner: &dyn CommandRunner, parts: &[&str]) -> Result<CommandOutput> {
    let mut argv = Vec::with_capacity(parts.len() + 1);
    argv.push(SUDO);
    argv.extend_from_slice(parts);
    let output = exec(runner, &argv).await?;
    if !output.success() {
        return Err(ExecError {
            program: parts.first().copied().unwrap_or_default().to_string(),
            code: output.code,
        }
        .into());
    }
    Ok(output)
}

/// Run a command whose failure is logged but never propagated
pub async fn exec_logged(runner: &dyn CommandRunner, parts: &[&str]) {
    match exec(runner, parts).await {
        Ok(output) if output.success() => {}
        Ok(output) => log::warn!("{} exited with status {}", parts.join(" "), output.code),
        Err(e) => log::warn!("{} failed: {:#}", parts.join(" "), e),
    }
}

/// Check whether a process with the given name is running
pub async fn is_process_alive(runner: &dyn CommandRunner, name: &str) -> Result<bool> {
    let output = exec(runner, &[PIDOF, name])
        .await
        .with_context(|| format!("Failed to query process state of {}", name))?;
    Ok(!output.stdout.trim().is_empty())
}

/// Work that must continue after the requesting process has answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackgroundJob {
    /// Take the primary interface down, optionally rewrite it, bring it up
    NetworkRestart {
        /// Addressing to write while the interface is down
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<NetworkInterfaceConfig>,
    },
    /// Write a firmware image to flash
    Flash {
        /// Partition to write
        region: FlashRegion,
        /// Image location
        url: String,
        /// Skip the product check
        allow_other_products: bool,
    },
    /// Restart the device once the caller has answered
    Reboot,
}

#[derive(Serialize, Deserialize)]
struct JobEnvelope {
    job: BackgroundJob,
}

impl BackgroundJob {
    /// Serialize for handing to a worker process
    pub fn encode(&self) -> Result<String> {
        toml::to_string(&JobEnvelope { job: self.clone() }).context("Failed to encode job")
    }

    /// Inverse of [`BackgroundJob::encode`]
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: JobEnvelope = toml::from_str(text).context("Failed to decode job")?;
        Ok(envelope.job)
    }
}

/// Capability to start work that outlives the caller
pub trait Background: Send + Sync {
    /// Start `job` without waiting for it
    fn spawn(&self, job: BackgroundJob) -> Result<()>;
}

/// Re-executes this binary as a detached worker with its output closed, so
/// the requesting side can return before the job finishes
#[derive(Debug, Clone, Default)]
pub struct DetachedWorker {
    config_path: Option<PathBuf>,
}

impl DetachedWorker {
    /// Hidden subcommand the worker is started with
    pub const SUBCOMMAND: &'static str = "run-job";

    /// Worker that passes `config_path` on to the child
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }
}

impl Background for DetachedWorker {
    fn spawn(&self, job: BackgroundJob) -> Result<()> {
        let exe = std::env::current_exe().context("Failed to locate own executable")?;
        let encoded = job.encode()?;

        let mut cmd = std::process::Command::new(exe);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg(Self::SUBCOMMAND)
            .arg(encoded)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Own process group: the web server reaping the request must not take the worker along
            .process_group(0);

        let child = cmd.spawn().context("Failed to spawn background worker")?;
        log::info!("Started background worker (pid {}) for {:?}", child.id(), job);

        // Dropping the handle neither waits for nor kills the worker
        drop(child);
        Ok(())
    }
}
