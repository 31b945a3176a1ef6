//! INI-backed persistence for [`NodeConfig`].
//!
//! The file lives at `~/.nodewarden/config.ini`. A missing file yields
//! defaults; a present file only needs the keys it wants to override.
//!
//! ```ini
//! [node]
//! bind_address = 0.0.0.0:4344
//! local_dirs = /data/1/warden,/data/2/warden
//!
//! [security]
//! enabled = false
//!
//! [kill]
//! grace_millis = 250
//! force_millis = 5000
//!
//! [cache]
//! target_bytes = 10737418240
//! ```

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

use super::settings::NodeConfig;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to read or parse the config file.
    #[error("failed to read config file: {0}")]
    Read(#[from] ini::Error),

    /// Failed to write the config file.
    #[error("failed to write config file: {0}")]
    Write(String),

    /// A key held a value that does not parse.
    #[error("invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        /// INI section.
        section: String,
        /// Key within the section.
        key: String,
        /// Offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Loader and writer for the on-disk configuration.
pub struct ConfigFile;

impl ConfigFile {
    /// Loads configuration from the default path, or defaults when the
    /// file does not exist.
    pub fn load() -> Result<NodeConfig, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<NodeConfig, ConfigFileError> {
        if !path.exists() {
            return Ok(NodeConfig::default());
        }

        let ini = Ini::load_from_file(path)?;
        let mut config = NodeConfig::default();

        if let Some(value) = ini.get_from(Some("node"), "bind_address") {
            config.bind_address = value.to_string();
        }
        if let Some(value) = ini.get_from(Some("node"), "local_dirs") {
            config.local_dirs = value
                .split(',')
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(value) = ini.get_from(Some("security"), "enabled") {
            config.security_enabled = parse_bool("security", "enabled", value)?;
        }
        if let Some(value) = ini.get_from(Some("kill"), "grace_millis") {
            config.kill_grace_millis = parse_u64("kill", "grace_millis", value)?;
        }
        if let Some(value) = ini.get_from(Some("kill"), "force_millis") {
            config.kill_force_millis = parse_u64("kill", "force_millis", value)?;
        }
        if let Some(value) = ini.get_from(Some("cache"), "target_bytes") {
            config.cache_target_bytes = parse_u64("cache", "target_bytes", value)?;
        }

        Ok(config)
    }

    /// Writes a config file at `path`, creating parent directories.
    pub fn save_to(config: &NodeConfig, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigFileError::Write(e.to_string()))?;
        }

        let local_dirs = config
            .local_dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut ini = Ini::new();
        ini.with_section(Some("node"))
            .set("bind_address", config.bind_address.clone())
            .set("local_dirs", local_dirs);
        ini.with_section(Some("security"))
            .set("enabled", config.security_enabled.to_string());
        ini.with_section(Some("kill"))
            .set("grace_millis", config.kill_grace_millis.to_string())
            .set("force_millis", config.kill_force_millis.to_string());
        ini.with_section(Some("cache"))
            .set("target_bytes", config.cache_target_bytes.to_string());

        ini.write_to_file(path)
            .map_err(|e| ConfigFileError::Write(e.to_string()))
    }
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigFileError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(section, key, value, "expected a boolean")),
    }
}

fn parse_u64(section: &str, key: &str, value: &str) -> Result<u64, ConfigFileError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, "expected a non-negative integer"))
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Returns the configuration directory, `~/.nodewarden`.
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nodewarden")
}

/// Returns the configuration file path, `~/.nodewarden/config.ini`.
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}
