// Configuration file parser

//! Engine configuration loading and validation
//!
//! The engine's own TOML file only relocates paths and sets the log level.
//! Every field has a device default, so the file itself is optional.

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Default location of the engine configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/at-admin/at-admin.toml";

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Load the given file, or fall back to device defaults when `path` is the
/// default location and nothing is installed there
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
        return Ok(Config::default());
    }
    load_config(path)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.general.log_level.is_empty() {
        anyhow::bail!("log_level cannot be empty");
    }

    let paths = &config.paths;
    let named = [
        ("config_dir", &paths.config_dir),
        ("interfaces", &paths.interfaces),
        ("resolv_conf", &paths.resolv_conf),
        ("bridges", &paths.bridges),
        ("settings", &paths.settings),
        ("hostname", &paths.hostname),
        ("hosts", &paths.hosts),
        ("crontab", &paths.crontab),
        ("firewall_store", &paths.firewall_store),
        ("firewall_script", &paths.firewall_script),
        ("work_dir", &paths.work_dir),
    ];

    for (name, path) in named {
        if path.as_os_str().is_empty() {
            anyhow::bail!("paths.{} cannot be empty", name);
        }
        // Paths are handed to sudo cp/rm, which run from an unknown cwd
        if !path.is_absolute() {
            anyhow::bail!("paths.{} must be absolute, got {}", name, path.display());
        }
    }

    // The staged firewall store must never shadow the committed one
    if paths.firewall_staged() == paths.firewall_store {
        anyhow::bail!("paths.work_dir places the staged firewall on the committed store");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_relative_path() {
        let mut config = Config::default();
        config.paths.interfaces = PathBuf::from("etc/config/interfaces");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("paths.interfaces"));
    }

    #[test]
    fn test_validate_empty_path() {
        let mut config = Config::default();
        config.paths.work_dir = PathBuf::new();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_empty_log_level() {
        let mut config = Config::default();
        config.general.log_level = String::new();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_staged_collision() {
        let mut config = Config::default();
        config.paths.work_dir = PathBuf::from("/etc/config");
        config.paths.firewall_store = PathBuf::from("/etc/config/firewall");
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = std::env::temp_dir().join(format!("at-admin-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("at-admin.toml");
        fs::write(
            &path,
            "[general]\nlog_level = \"debug\"\n\n[paths]\nwork_dir = \"/run/at-admin\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.paths.work_dir, PathBuf::from("/run/at-admin"));

        fs::write(&path, "[paths]\nwork_dir = \"relative\"\n").unwrap();
        assert!(load_config(&path).is_err());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(load_config_or_default("/nonexistent/at-admin.toml").is_err());
    }
}
