// Configuration management for the blelink CLI
//
// Session defaults stored as JSON in:
// - macOS: ~/Library/Application Support/blelink/config.json
// - Linux: ~/.config/blelink/config.json
// - Windows: %APPDATA%\blelink\config.json

use anyhow::{Context, Result};
use blelink_core::{ScanConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Keep links alive with the reconnection guardian
    pub guarded_reconnect: bool,

    /// Delay before a standard reconnect (ms)
    pub reconnect_interval_ms: u64,

    /// Reconnect budget, -1 for unlimited
    pub max_reconnect_attempts: i32,

    /// Connect-phase deadline (ms)
    pub connection_timeout_ms: u64,

    /// Per-operation deadline (ms)
    pub operation_timeout_ms: u64,

    /// Negotiate `preferred_mtu` after discovery
    pub auto_negotiate_mtu: bool,

    pub preferred_mtu: u16,

    /// Enable notifications on every capable characteristic once ready
    pub auto_notify: bool,

    /// Run a targeted scan while connecting
    pub assist_scan: bool,

    /// Scanner duty cycle
    pub scan: ScanWindows,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanWindows {
    /// On-window length in seconds
    pub scan_window_secs: u64,

    /// Off-window length in seconds
    pub idle_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            guarded_reconnect: false,
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: -1,
            connection_timeout_ms: 10_000,
            operation_timeout_ms: 5_000,
            // Desktop stacks negotiate the MTU themselves.
            auto_negotiate_mtu: false,
            preferred_mtu: 517,
            auto_notify: true,
            assist_scan: true,
            scan: ScanWindows::default(),
        }
    }
}

impl Default for ScanWindows {
    fn default() -> Self {
        Self {
            scan_window_secs: 30,
            idle_window_secs: 1,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blelink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Session configuration for `address` built from these defaults
    pub fn session_config(&self, address: &str) -> Result<SessionConfig> {
        SessionConfig::builder(address)
            .guarded_reconnect(self.guarded_reconnect)
            .reconnect_interval_ms(self.reconnect_interval_ms)
            .max_reconnect_attempts(self.max_reconnect_attempts)
            .connection_timeout_ms(self.connection_timeout_ms)
            .operation_timeout_ms(self.operation_timeout_ms)
            .auto_negotiate_mtu(self.auto_negotiate_mtu)
            .preferred_mtu(self.preferred_mtu)
            .auto_notify(self.auto_notify)
            .assist_scan(self.assist_scan)
            .build()
            .with_context(|| format!("Invalid session settings for {}", address))
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            scan_window: Duration::from_secs(self.scan.scan_window_secs),
            idle_window: Duration::from_secs(self.scan.idle_window_secs),
        }
    }

    /// Set a config value (not persisted)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "guarded_reconnect" => {
                self.guarded_reconnect = value.parse().context("Invalid boolean value")?;
            }
            "reconnect_interval_ms" => {
                self.reconnect_interval_ms = value.parse().context("Invalid number")?;
            }
            "max_reconnect_attempts" => {
                self.max_reconnect_attempts = value.parse().context("Invalid number")?;
            }
            "connection_timeout_ms" => {
                self.connection_timeout_ms = value.parse().context("Invalid number")?;
            }
            "operation_timeout_ms" => {
                self.operation_timeout_ms = value.parse().context("Invalid number")?;
            }
            "auto_negotiate_mtu" => {
                self.auto_negotiate_mtu = value.parse().context("Invalid boolean value")?;
            }
            "preferred_mtu" => {
                let mtu: u16 = value.parse().context("Invalid MTU")?;
                if !(23..=517).contains(&mtu) {
                    anyhow::bail!("MTU must be between 23 and 517");
                }
                self.preferred_mtu = mtu;
            }
            "auto_notify" => {
                self.auto_notify = value.parse().context("Invalid boolean value")?;
            }
            "assist_scan" => {
                self.assist_scan = value.parse().context("Invalid boolean value")?;
            }
            "scan_window_secs" => {
                self.scan.scan_window_secs = value.parse().context("Invalid number")?;
            }
            "idle_window_secs" => {
                self.scan.idle_window_secs = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("guarded_reconnect".to_string(), self.guarded_reconnect.to_string()),
            ("reconnect_interval_ms".to_string(), self.reconnect_interval_ms.to_string()),
            ("max_reconnect_attempts".to_string(), self.max_reconnect_attempts.to_string()),
            ("connection_timeout_ms".to_string(), self.connection_timeout_ms.to_string()),
            ("operation_timeout_ms".to_string(), self.operation_timeout_ms.to_string()),
            ("auto_negotiate_mtu".to_string(), self.auto_negotiate_mtu.to_string()),
            ("preferred_mtu".to_string(), self.preferred_mtu.to_string()),
            ("auto_notify".to_string(), self.auto_notify.to_string()),
            ("assist_scan".to_string(), self.assist_scan.to_string()),
            ("scan_window_secs".to_string(), self.scan.scan_window_secs.to_string()),
            ("idle_window_secs".to_string(), self.scan.idle_window_secs.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.guarded_reconnect);
        assert_eq!(config.max_reconnect_attempts, -1);
        assert_eq!(config.scan_config(), ScanConfig::default());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_settings_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("guarded_reconnect", "true").unwrap();
        config.set("reconnect_interval_ms", "1500").unwrap();
        config.set("idle_window_secs", "4").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert!(reloaded.guarded_reconnect);
        assert_eq!(reloaded.get("reconnect_interval_ms").as_deref(), Some("1500"));
        assert_eq!(reloaded.scan_config().idle_window, Duration::from_secs(4));
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"preferred_mtu": 247}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.preferred_mtu, 247);
        assert_eq!(config.connection_timeout_ms, 10_000);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("preferred_mtu", "9000").is_err());
        assert!(config.set("auto_notify", "maybe").is_err());
        assert!(config.set("no_such_key", "1").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_session_config_uses_defaults() {
        let mut config = Config::default();
        config.set("guarded_reconnect", "true").unwrap();
        let session = config.session_config("aa:bb:cc:dd:ee:ff").unwrap();
        assert!(session.enable_guarded_reconnect);
        assert!(!session.auto_negotiate_mtu);
        assert_eq!(session.address.as_str(), "AA:BB:CC:DD:EE:FF");
        assert!(config.session_config("nope").is_err());
    }
}
