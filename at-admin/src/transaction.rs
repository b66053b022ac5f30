// Settings transaction

//! Commit, rollback and factory reset of the device configuration
//!
//! Live config under the config directory is only kept across reboots once
//! `flatfsd -s` writes it to flash. Until then the unsaved-settings flag is
//! raised and a rollback restores what flash holds.

use crate::exec::{self, BackgroundJob, CP, CRONTAB, FLATFSD, HOSTNAME, RM};
use crate::flags::TransactionFlag;
use crate::store::Store;
use anyhow::{Context, Result};

/// Remove a flag, logging instead of failing the transaction
async fn clear_or_log(store: &Store, flag: TransactionFlag) {
    if let Err(e) = store.flags().clear(store.runner(), flag).await {
        log::error!("{:#}", e);
    }
}

/// Write the live configuration to flash
pub async fn commit(store: &Store) -> Result<()> {
    exec::sudo(store.runner(), &[FLATFSD, "-s"])
        .await
        .context("flatfsd -s failed")?;

    clear_or_log(store, TransactionFlag::UnsavedSettings).await;

    let flags = store.flags();
    if flags.is_set(TransactionFlag::SettingsInitialized) {
        clear_or_log(store, TransactionFlag::SettingsInitialized).await;
    }

    log::info!("Settings saved to flash");
    Ok(())
}

/// Discard live changes and restore the configuration held in flash
pub async fn rollback(store: &Store) -> Result<()> {
    let runner = store.runner();
    let paths = store.paths();

    exec::sudo(runner, &[FLATFSD, "-r"])
        .await
        .context("flatfsd -r failed")?;

    let hostname = paths.hostname.to_string_lossy().into_owned();
    exec::sudo(runner, &[HOSTNAME, "-F", hostname.as_str()])
        .await
        .context("Failed to restore hostname")?;

    store.spawn(BackgroundJob::NetworkRestart { config: None })?;

    clear_or_log(store, TransactionFlag::UnsavedSettings).await;
    clear_or_log(store, TransactionFlag::SettingsInitialized).await;

    let crontab = paths.crontab.to_string_lossy().into_owned();
    exec::exec_logged(runner, &[exec::SUDO, CRONTAB, crontab.as_str()]).await;

    log::info!("Settings restored from flash");
    Ok(())
}

/// Reset flash to factory defaults while keeping the live config until reboot
///
/// `flatfsd -w` wipes the config directory, so it is copied aside first and
/// put back afterwards.
pub async fn factory_reset(store: &Store) -> Result<()> {
    let runner = store.runner();
    let paths = store.paths();
    let config_dir = paths.config_dir.to_string_lossy().into_owned();
    let backup = paths.config_backup().to_string_lossy().into_owned();

    if let Err(e) = exec::sudo(runner, &[CP, "-a", config_dir.as_str(), backup.as_str()]).await {
        log::warn!("Failed to copy {} aside: {:#}", config_dir, e);
    }

    exec::sudo(runner, &[FLATFSD, "-w"])
        .await
        .context("flatfsd -w failed")?;

    let sudo = exec::SUDO;
    exec::exec_logged(runner, &[sudo, RM, "-rf", config_dir.as_str()]).await;
    exec::exec_logged(runner, &[sudo, CP, "-a", backup.as_str(), config_dir.as_str()]).await;
    exec::exec_logged(runner, &[sudo, RM, "-rf", backup.as_str()]).await;

    clear_or_log(store, TransactionFlag::UnsavedSettings).await;
    store
        .flags()
        .set(TransactionFlag::SettingsInitialized)
        .context("Failed to record factory reset")?;

    log::info!("Flash reset to factory defaults");
    Ok(())
}

/// Mark a raised flag as seen by the user
pub fn acknowledge(store: &Store, flag: TransactionFlag) -> Result<()> {
    store
        .flags()
        .acknowledge(flag)
        .with_context(|| format!("Failed to acknowledge {}", flag.file_name()))
}
