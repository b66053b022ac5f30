// Per-request context

//! Everything one admin action needs: file locations, the command runner and
//! the background launcher
//!
//! A `Store` is built once per process from the loaded config. Configuration
//! files are read fresh through it on every action; nothing is cached.

use crate::codec;
use crate::exec::{self, Background, BackgroundJob, CommandRunner, REBOOT};
use crate::firmware;
use crate::flags::Flags;
use crate::reconfigure::{Orchestrator, Timing};
use crate::settings::SystemSettings;
use crate::types::PathsConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Per-process context for admin actions and background jobs
pub struct Store {
    paths: PathsConfig,
    runner: Arc<dyn CommandRunner>,
    background: Arc<dyn Background>,
    timing: Timing,
}

impl Store {
    /// Context over `paths` with the given runner and background launcher
    pub fn new(
        paths: PathsConfig,
        runner: Arc<dyn CommandRunner>,
        background: Arc<dyn Background>,
    ) -> Self {
        Self {
            paths,
            runner,
            background,
            timing: Timing::default(),
        }
    }

    /// Override poll and settle delays of the reconfiguration sequence
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Every file location
    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    /// Command runner for OS side effects
    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Launcher for detached work
    pub fn background(&self) -> &dyn Background {
        self.background.as_ref()
    }

    /// Reconfiguration delays
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Transaction flags under the work directory
    pub fn flags(&self) -> Flags {
        Flags::new(&self.paths.work_dir)
    }

    /// Load the settings file as it is on disk now
    pub fn settings(&self) -> Result<SystemSettings> {
        SystemSettings::load(&self.paths.settings).context("Failed to load at-admin settings")
    }

    /// Publish a regenerated file through the privileged copy
    pub async fn publish(&self, target: &Path, content: &str) -> Result<()> {
        codec::publish(self.runner(), &self.paths.work_dir, target, content).await
    }

    /// Hand a job to the background launcher
    pub fn spawn(&self, job: BackgroundJob) -> Result<()> {
        self.background
            .spawn(job)
            .context("Failed to start background job")
    }

    /// Execute a job in this process; the worker side of [`Store::spawn`]
    pub async fn run_job(&self, job: BackgroundJob) -> Result<()> {
        log::info!("Running background job {:?}", job);

        match job {
            BackgroundJob::NetworkRestart { config } => {
                let settings = self.settings()?;
                let report = Orchestrator::new(self, &settings)
                    .restart(config.as_ref())
                    .await;
                log::info!("Network restart finished in state {:?}", report.state);
                Ok(())
            }
            BackgroundJob::Flash {
                region,
                url,
                allow_other_products,
            } => firmware::run_flash(self, region, &url, allow_other_products).await,
            BackgroundJob::Reboot => {
                exec::sudo(self.runner(), &[REBOOT])
                    .await
                    .context("Failed to reboot")?;
                Ok(())
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use crate::flags::TransactionFlag;

    #[test]
    fn test_settings_loaded_fresh() {
        let fx = Fixture::new("store-settings");
        assert_eq!(fx.store.settings().unwrap().primary_if, "eth0");

        fx.write(
            &fx.paths().settings,
            &testing::SETTINGS.replace("\"eth0\"", "\"br0\""),
        );
        assert_eq!(fx.store.settings().unwrap().primary_if, "br0");
    }

    #[test]
    fn test_missing_settings_is_error() {
        let fx = Fixture::new("store-no-settings");
        std::fs::remove_file(&fx.paths().settings).unwrap();
        assert!(fx.store.settings().is_err());
    }

    #[test]
    fn test_flags_live_in_work_dir() {
        let fx = Fixture::new("store-flags");
        fx.store.flags().set(TransactionFlag::UnsavedSettings).unwrap();
        assert!(fx.paths().work_dir.join("unsavedsettings").exists());
    }

    #[test]
    fn test_spawn_records_job() {
        let fx = Fixture::new("store-spawn");
        fx.store
            .spawn(BackgroundJob::NetworkRestart { config: None })
            .unwrap();
        assert_eq!(
            fx.background.jobs(),
            vec![BackgroundJob::NetworkRestart { config: None }]
        );
    }

    #[tokio::test]
    async fn test_run_reboot_job() {
        let fx = Fixture::new("store-run-reboot");
        fx.store.run_job(BackgroundJob::Reboot).await.unwrap();
        assert_eq!(fx.runner.calls(), vec!["/usr/bin/sudo /sbin/reboot"]);

        fx.runner.respond("/usr/bin/sudo /sbin/reboot", "", 1);
        assert!(fx.store.run_job(BackgroundJob::Reboot).await.is_err());
    }

    #[tokio::test]
    async fn test_run_flash_job_invokes_netflash() {
        let fx = Fixture::new("store-run-flash");
        fx.store
            .run_job(BackgroundJob::Flash {
                region: crate::types::FlashRegion::Kernel,
                url: "http://example.com/linux.bin.gz".to_string(),
                allow_other_products: false,
            })
            .await
            .unwrap();
        assert_eq!(
            fx.runner.calls_starting_with("/usr/bin/sudo /bin/netflash"),
            vec!["/usr/bin/sudo /bin/netflash -k -b -n -r /dev/flash/kernel http://example.com/linux.bin.gz"]
        );
    }
}
