use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

/// Structure representing the engine configuration. Contains timing, limits and the log location
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Wait between read attempts when following a file that is still being written
    pub retry_interval_ms: u64,
    /// Number of buffers between buffer-count status messages
    pub status_interval: u64,
    /// Longest payload the framed source keeps; longer ones are truncated
    pub max_buffer_bytes: usize,
    /// How long an online read waits for data before checking for unattach
    pub poll_interval_ms: u64,
    /// How long connecting to an online source may take before the attach fails
    pub connect_timeout_ms: u64,
    /// Capacity multiplier applied when a scaler histogram runs out of bins
    pub scaler_growth_factor: f64,
    pub log_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_interval_ms: 10_000,
            status_interval: 100,
            max_buffer_bytes: 1 << 20,
            poll_interval_ms: 250,
            connect_timeout_ms: 5_000,
            scaler_growth_factor: 2.0,
            log_path: PathBuf::from("livehist.log"),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Growth factors at or below one would never make room
    pub fn is_growth_factor_valid(&self) -> bool {
        self.scaler_growth_factor > 1.0
    }
}
