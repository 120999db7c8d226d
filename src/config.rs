// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving central settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::ble_constants::config::MAX_MTU;

const APP_DIR: &str = "blemidi-central";
const CONFIG_FILE: &str = "config.toml";

/// How the MTU phase is carried out on this platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtuStrategy {
    /// Ask the peer and wait for the MTU-change callback.
    #[default]
    Request,
    /// The stack negotiates on its own; assume the maximum right away.
    AssumeMax,
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Negotiation settings.
    pub central: CentralConfig,

    /// Discovery settings.
    pub scan: ScanConfig,

    /// Additional MIDI UUIDs for non-standard peripherals.
    pub midi: MidiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Start sessions as soon as they are attached.
    pub auto_start_sessions: bool,

    /// Pair with peripherals before configuring their sessions.
    pub require_bonding: bool,

    /// Upper bound for waiting on the negotiation lock.
    pub negotiation_timeout_ms: u64,

    /// MTU asked for during negotiation.
    pub requested_mtu: u16,

    pub mtu_strategy: MtuStrategy,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            auto_start_sessions: true,
            require_bonding: false,
            negotiation_timeout_ms: 30_000,
            requested_mtu: MAX_MTU,
            mtu_strategy: MtuStrategy::Request,
        }
    }
}

impl CentralConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan duration; 0 scans until stopped.
    pub timeout_ms: u64,

    /// Stop scanning once a device was found and connected.
    pub stop_on_connect: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            stop_on_connect: true,
        }
    }
}

impl ScanConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Services searched after the standard BLE-MIDI service.
    pub extra_service_uuids: Vec<Uuid>,

    /// Characteristics searched after the standard BLE-MIDI characteristic.
    pub extra_characteristic_uuids: Vec<Uuid>,
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(CONFIG_FILE)
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.central.auto_start_sessions);
        assert!(!config.central.require_bonding);
        assert_eq!(config.central.requested_mtu, 517);
        assert_eq!(config.central.negotiation_timeout(), Duration::from_secs(30));
        assert_eq!(config.scan.timeout(), Some(Duration::from_secs(10)));
        assert!(config.midi.extra_service_uuids.is_empty());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.central.mtu_strategy, MtuStrategy::Request);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = Config::default();
        config.central.require_bonding = true;
        config.central.mtu_strategy = MtuStrategy::AssumeMax;
        config.scan.timeout_ms = 0;
        config
            .midi
            .extra_service_uuids
            .push(Uuid::from_u128(0x1234_5678_0000_1000_8000_0080_5f9b_34fb));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.central.require_bonding);
        assert_eq!(loaded.central.mtu_strategy, MtuStrategy::AssumeMax);
        assert_eq!(loaded.scan.timeout(), None);
        assert_eq!(loaded.midi.extra_service_uuids.len(), 1);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[central]\nmtu_strategy = \"assume_max\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.central.mtu_strategy, MtuStrategy::AssumeMax);
        assert!(config.central.auto_start_sessions);
        assert!(config.scan.stop_on_connect);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[central]\nrequested_mtu = \"lots\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
