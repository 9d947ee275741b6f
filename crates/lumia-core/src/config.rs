//! TOML configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ffu::ManifestOptions;

/// Device monitor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long a legacy combined-interface arrival waits for the modern
    /// interface to claim the same device.
    pub legacy_interface_window_ms: u64,
    /// Delay before resolving the volume of a mass-storage arrival.
    pub mass_storage_settle_ms: u64,
    /// USB watcher polling period.
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            legacy_interface_window_ms: 1000,
            mass_storage_settle_ms: 1000,
            poll_interval_ms: 250,
        }
    }
}

impl MonitorConfig {
    pub fn legacy_interface_window(&self) -> Duration {
        Duration::from_millis(self.legacy_interface_window_ms)
    }

    pub fn mass_storage_settle(&self) -> Duration {
        Duration::from_millis(self.mass_storage_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Bound on each wait of a mode switch. Unset waits forever.
    pub timeout_secs: Option<u64>,
}

impl SwitchConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Reject flash parts whose length is not a whole number of chunks.
    pub check_alignment: bool,
    /// Ask insecure devices to skip the image signature check.
    pub skip_signature_when_insecure: bool,
    #[serde(flatten)]
    pub manifest: ManifestOptions,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            check_alignment: true,
            skip_signature_when_insecure: true,
            manifest: ManifestOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LumiaConfig {
    pub monitor: MonitorConfig,
    pub switch: SwitchConfig,
    pub flash: FlashConfig,
}

impl LumiaConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: LumiaConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
