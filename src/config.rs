use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime settings for the relay binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Path to the adb binary
    pub adb_path: String,
    /// Device serial passed as `adb -s`
    pub serial: Option<String>,
    /// Package whose runtime permissions are checked and granted
    pub package: String,
    /// How often the dialog is sampled while a session is open
    pub poll_interval_ms: u64,
    /// Give up on a session whose dialog never appears
    pub dialog_timeout_ms: u64,
    /// Default tracing filter when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            serial: None,
            package: "com.android.shell".to_string(),
            poll_interval_ms: 500,
            dialog_timeout_ms: 30_000,
            log_filter: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load from `$USSD_RELAY_CONFIG` or the user config dir, then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("USSD_RELAY_CONFIG")
            .map(PathBuf::from)
            .or_else(default_path);

        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        if let Ok(serial) = std::env::var("ADB_SERIAL") {
            if !serial.is_empty() {
                config.serial = Some(serial);
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    pub fn dialog_timeout(&self) -> Duration {
        Duration::from_millis(self.dialog_timeout_ms)
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ussd-relay").join("config.json"))
}
