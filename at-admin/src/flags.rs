// Transaction flag files

//! Sentinel files tracking the settings transaction
//!
//! Each flag is a small file in the work directory. `notyetchecked` means the
//! flag is raised; `checked` means the user has seen it. Any other content, or
//! no file at all, reads as not set.

use crate::exec::{self, CommandRunner, RM};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// The flags the admin UI reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFlag {
    /// Live config differs from what flash holds
    UnsavedSettings,
    /// A firmware image was written since the last reboot
    UpdatedFirmware,
    /// Settings were reset to defaults and not yet committed
    SettingsInitialized,
}

impl TransactionFlag {
    /// File name under the work directory
    pub fn file_name(&self) -> &'static str {
        match self {
            TransactionFlag::UnsavedSettings => "unsavedsettings",
            TransactionFlag::UpdatedFirmware => "updatedfirmware",
            TransactionFlag::SettingsInitialized => "settingsinited",
        }
    }

    /// Full path of the flag file
    pub fn path(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(self.file_name())
    }
}

/// Recorded content of a flag file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    /// Raised, not yet seen by the user
    NotYetChecked,
    /// Seen by the user
    Checked,
}

impl FlagState {
    fn as_str(&self) -> &'static str {
        match self {
            FlagState::NotYetChecked => "notyetchecked",
            FlagState::Checked => "checked",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "notyetchecked" => Some(FlagState::NotYetChecked),
            "checked" => Some(FlagState::Checked),
            _ => None,
        }
    }
}

/// Flag files under one work directory
#[derive(Debug, Clone)]
pub struct Flags {
    work_dir: PathBuf,
}

impl Flags {
    /// Flags stored under `work_dir`
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
        }
    }

    fn write(&self, flag: TransactionFlag, state: FlagState) -> Result<()> {
        if !self.work_dir.exists() {
            fs::create_dir_all(&self.work_dir).context("Failed to create work directory")?;
        }
        fs::write(flag.path(&self.work_dir), state.as_str())
            .with_context(|| format!("Failed to write flag {}", flag.file_name()))
    }

    /// Raise a flag
    pub fn set(&self, flag: TransactionFlag) -> Result<()> {
        log::debug!("Setting flag {}", flag.file_name());
        self.write(flag, FlagState::NotYetChecked)
    }

    /// Mark a raised flag as seen
    pub fn acknowledge(&self, flag: TransactionFlag) -> Result<()> {
        self.write(flag, FlagState::Checked)
    }

    /// Recorded state, `None` when absent or unreadable
    pub fn state(&self, flag: TransactionFlag) -> Option<FlagState> {
        fs::read_to_string(flag.path(&self.work_dir))
            .ok()
            .and_then(|text| FlagState::parse(&text))
    }

    /// True only for a raised, unseen flag
    pub fn is_set(&self, flag: TransactionFlag) -> bool {
        self.state(flag) == Some(FlagState::NotYetChecked)
    }

    /// Remove the flag file with `rm`; a missing file is not an error
    pub async fn clear(&self, runner: &dyn CommandRunner, flag: TransactionFlag) -> Result<()> {
        let path = flag.path(&self.work_dir);
        if !path.exists() {
            return Ok(());
        }
        let path = path.to_string_lossy().into_owned();
        exec::exec_checked(runner, &[RM, path.as_str()])
            .await
            .with_context(|| format!("Failed to clear flag {}", flag.file_name()))?;
        Ok(())
    }

    /// Log a failed flag write without failing the action that raised it
    pub fn set_or_log(&self, flag: TransactionFlag) {
        if let Err(e) = self.set(flag) {
            log::error!("Failed to set {} flag: {:#}", flag.file_name(), e);
        }
    }
}
