// at-admin system settings

//! The admin tool's own settings file
//!
//! Holds the product name, the primary interface pointer and the firmware
//! download location, in the quoted dialect. Every key is required.

use crate::codec::{self, QuotedDocument};
use crate::error::ValidationError;
use crate::exec::CommandRunner;
use crate::types::Product;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

const KEY_VERSION: &str = "VERSION";
const KEY_PRODUCT_NAME: &str = "PRODUCT_NAME";
const KEY_PRIMARY_IF: &str = "PRIMARY_IF";
const KEY_FIRMWARE_URL: &str = "FIRMWARE_URL";
const KEY_KERNEL_MATCH: &str = "FIRMWARE_KERNEL_MATCH";
const KEY_USERLAND_MATCH: &str = "FIRMWARE_USERLAND_MATCH";

/// Parsed settings file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSettings {
    /// Firmware version string
    pub version: String,
    /// Product name, e.g. `Armadillo-230`
    pub product_name: String,
    /// Interface subsequent network edits act on
    pub primary_if: String,
    /// Always ends with `/`
    pub firmware_url: String,
    /// Substrings identifying kernel images
    pub kernel_matches: Vec<String>,
    /// Substrings identifying userland images
    pub userland_matches: Vec<String>,
}

impl SystemSettings {
    /// Read and parse the settings file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        Self::parse(&text)
    }

    /// Parse settings text; every key is required
    pub fn parse(text: &str) -> Result<Self> {
        let doc = QuotedDocument::parse(text);

        let required = |key: &str| -> Result<String> {
            match doc.get(key) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => anyhow::bail!("Settings are missing {}", key),
            }
        };

        let mut firmware_url = required(KEY_FIRMWARE_URL)?;
        if !firmware_url.ends_with('/') {
            firmware_url.push('/');
        }

        Ok(Self {
            version: required(KEY_VERSION)?,
            product_name: required(KEY_PRODUCT_NAME)?,
            primary_if: required(KEY_PRIMARY_IF)?,
            firmware_url,
            kernel_matches: codec::split_values(&required(KEY_KERNEL_MATCH)?),
            userland_matches: codec::split_values(&required(KEY_USERLAND_MATCH)?),
        })
    }

    /// Render in the quoted dialect, ending with a blank line
    pub fn render(&self) -> String {
        let mut doc = QuotedDocument::default();
        doc.set(KEY_VERSION, &self.version);
        doc.set(KEY_PRODUCT_NAME, &self.product_name);
        doc.set(KEY_PRIMARY_IF, &self.primary_if);
        doc.set(KEY_FIRMWARE_URL, &self.firmware_url);
        doc.set_list(KEY_KERNEL_MATCH, &self.kernel_matches);
        doc.set_list(KEY_USERLAND_MATCH, &self.userland_matches);
        doc.render()
    }

    /// Write the settings back through the privileged copy
    pub async fn save(
        &self,
        runner: &dyn CommandRunner,
        work_dir: &Path,
        path: &Path,
    ) -> Result<()> {
        codec::publish(runner, work_dir, path, &self.render())
            .await
            .context("Failed to save at-admin settings")
    }

    /// Device model named by `PRODUCT_NAME`
    pub fn product(&self) -> Product {
        Product::from_name(&self.product_name)
    }

    /// Validate and apply a new firmware download location
    pub fn set_firmware_url(&mut self, url: &str) -> Result<(), ValidationError> {
        let url = url.trim_end_matches(['\r', '\n']);
        if url.trim().is_empty() {
            return Err(ValidationError::new("firmware_url", "Please enter a valid URL"));
        }
        if !is_valid_url(url) {
            return Err(ValidationError::new("firmware_url", "The URL is not valid"));
        }
        self.firmware_url = url.to_string();
        Ok(())
    }
}

/// `scheme://host[/path]` with a scheme the download tools understand
pub fn is_valid_url(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    if !matches!(scheme, "http" | "https" | "ftp") {
        return false;
    }
    let host = rest.split('/').next().unwrap_or_default();
    !host.is_empty()
        && !url.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'')
}
