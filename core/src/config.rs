//! Session configuration and device addressing.
//!
//! A [`SessionConfig`] is validated when it is built: a malformed device
//! address or an out-of-range MTU fails fast with [`ConfigError`] and is
//! never retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Smallest ATT MTU every link starts with.
pub const DEFAULT_MTU: u16 = 23;

/// Largest ATT MTU a peer may negotiate.
pub const MAX_MTU: u16 = 517;

/// Errors raised while building a configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid device address: {0:?}")]
    InvalidAddress(String),
    #[error("Preferred MTU {0} outside {min}..={max}", min = DEFAULT_MTU, max = MAX_MTU)]
    InvalidMtu(u16),
    #[error("Invalid duration for {0}")]
    InvalidDuration(&'static str),
}

/// A six-octet colon-separated hardware address, normalised to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parse `AA:BB:CC:DD:EE:FF` (either case).
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let octets: Vec<&str> = raw.split(':').collect();
        let well_formed = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

        if !well_formed {
            return Err(ConfigError::InvalidAddress(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against an address reported by a scan source.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

/// Per-device session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Target device
    pub address: DeviceAddress,
    /// Keep the link alive with the reconnection guardian
    pub enable_guarded_reconnect: bool,
    /// Delay before a standard-path reconnect (ms)
    pub reconnect_interval_ms: u64,
    /// Cumulative reconnect budget; negative means unlimited
    pub max_reconnect_attempts: i32,
    /// Connect-phase deadline (ms)
    pub connection_timeout_ms: u64,
    /// Request `preferred_mtu` once services are discovered
    pub auto_negotiate_mtu: bool,
    pub preferred_mtu: u16,
    /// Per-request deadline inside the operation queue (ms)
    pub operation_timeout_ms: u64,
    /// Run a transient scan while connecting
    pub enable_assist_scan: bool,
    /// Enable notify/indicate on every capable characteristic once ready
    pub enable_auto_notify: bool,
}

impl SessionConfig {
    /// Start a builder with the stock defaults for `address`.
    pub fn builder(address: &str) -> SessionConfigBuilder {
        SessionConfigBuilder::new(address)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(DEFAULT_MTU..=MAX_MTU).contains(&self.preferred_mtu) {
            return Err(ConfigError::InvalidMtu(self.preferred_mtu));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::InvalidDuration("connection_timeout_ms"));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::InvalidDuration("operation_timeout_ms"));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Fluent builder for [`SessionConfig`]
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    address: String,
    enable_guarded_reconnect: bool,
    reconnect_interval_ms: u64,
    max_reconnect_attempts: i32,
    connection_timeout_ms: u64,
    auto_negotiate_mtu: bool,
    preferred_mtu: u16,
    operation_timeout_ms: u64,
    enable_assist_scan: bool,
    enable_auto_notify: bool,
}

impl SessionConfigBuilder {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            enable_guarded_reconnect: false,
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: -1,
            connection_timeout_ms: 10_000,
            auto_negotiate_mtu: true,
            preferred_mtu: MAX_MTU,
            operation_timeout_ms: 5_000,
            enable_assist_scan: true,
            enable_auto_notify: true,
        }
    }

    pub fn guarded_reconnect(mut self, enable: bool) -> Self {
        self.enable_guarded_reconnect = enable;
        self
    }

    pub fn reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.reconnect_interval_ms = ms;
        self
    }

    pub fn max_reconnect_attempts(mut self, max: i32) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = ms;
        self
    }

    pub fn auto_negotiate_mtu(mut self, enable: bool) -> Self {
        self.auto_negotiate_mtu = enable;
        self
    }

    pub fn preferred_mtu(mut self, mtu: u16) -> Self {
        self.preferred_mtu = mtu;
        self
    }

    pub fn operation_timeout_ms(mut self, ms: u64) -> Self {
        self.operation_timeout_ms = ms;
        self
    }

    pub fn assist_scan(mut self, enable: bool) -> Self {
        self.enable_assist_scan = enable;
        self
    }

    pub fn auto_notify(mut self, enable: bool) -> Self {
        self.enable_auto_notify = enable;
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let config = SessionConfig {
            address: DeviceAddress::parse(&self.address)?,
            enable_guarded_reconnect: self.enable_guarded_reconnect,
            reconnect_interval_ms: self.reconnect_interval_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
            connection_timeout_ms: self.connection_timeout_ms,
            auto_negotiate_mtu: self.auto_negotiate_mtu,
            preferred_mtu: self.preferred_mtu,
            operation_timeout_ms: self.operation_timeout_ms,
            enable_assist_scan: self.enable_assist_scan,
            enable_auto_notify: self.enable_auto_notify,
        };
        config.validate()?;
        Ok(config)
    }
}
