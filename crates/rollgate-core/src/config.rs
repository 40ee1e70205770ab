//! rollgate.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interval::parse_interval;
use crate::types::Arch;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid interval {value:?}: {reason}")]
    InvalidInterval { value: String, reason: String },
    #[error("invalid channel alias {name:?}: {reason}")]
    InvalidAlias { name: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RollgateConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub rollout: RolloutConfig,
    #[serde(rename = "channel_alias")]
    pub channel_aliases: Vec<ChannelAlias>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/rollgate/rollgate.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Instances that have not polled within this window are ignored by
    /// every aggregate query.
    pub validity_interval: String,
    /// Disable a group's updates when a rollout fails its first attempt
    /// or times out in safe mode.
    pub disable_updates_on_failed_rollout: bool,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            validity_interval: "1 days".to_string(),
            disable_updates_on_failed_rollout: true,
        }
    }
}

impl RolloutConfig {
    pub fn validity_interval(&self) -> Result<Duration, ConfigError> {
        parse_interval(&self.validity_interval)
    }
}

/// Maps a well-known channel name reported in an Omaha `track` to a group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAlias {
    pub app_id: String,
    #[serde(default = "default_alias_arch")]
    pub arch: Arch,
    pub name: String,
    pub group_id: String,
}

fn default_alias_arch() -> Arch {
    Arch::All
}

impl RollgateConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RollgateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot: interval syntax and alias completeness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rollout.validity_interval()?;
        for alias in &self.channel_aliases {
            if alias.name.trim().is_empty() || alias.group_id.trim().is_empty() {
                return Err(ConfigError::InvalidAlias {
                    name: alias.name.clone(),
                    reason: "name and group_id must be set".to_string(),
                });
            }
            if alias.app_id.trim().is_empty() {
                return Err(ConfigError::InvalidAlias {
                    name: alias.name.clone(),
                    reason: "app_id must be set".to_string(),
                });
            }
        }
        Ok(())
    }
}
