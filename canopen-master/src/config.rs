use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use canopen_common::Bitrate;

/// Engine configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// CAN interface name, e.g. `can0` or `vcan0`.
    pub interface: String,
    pub bitrate: Bitrate,
    /// Feed sent frames back through the inbound queue.
    pub echo: bool,
    /// Per-attempt SDO reply timeout.
    pub sdo_timeout_ms: u64,
    /// Retransmissions before an unanswered SDO request is aborted.
    pub sdo_retries: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            bitrate: Bitrate::default(),
            echo: true,
            sdo_timeout_ms: 500,
            sdo_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn sdo_timeout(&self) -> Duration {
        Duration::from_millis(self.sdo_timeout_ms)
    }

    /// Load configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;
        Ok(())
    }
}
