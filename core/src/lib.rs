// blelink core: client-side BLE session layer
//
// Turns a single-outstanding-request GATT link into an ordered, recoverable
// session. Every session is an actor; the host radio stack is a capability
// the actor drives and whose callbacks are posted back onto its channel.

pub mod codec;
pub mod config;
pub mod gatt;
pub mod host;
pub mod manager;
pub mod scanner;
pub mod session;
pub mod sim;
pub mod timer;

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use codec::advertisement::{parse_advertisement, AdvertisementRecord};
pub use codec::heart_rate::{decode_heart_rate, HeartRateMeasurement, SensorContact};
pub use codec::{decode_known, KnownValue};
pub use config::{ConfigError, DeviceAddress, SessionConfig, SessionConfigBuilder};
pub use gatt::descriptor::{select_write_mode, CharacteristicDescriptor};
pub use gatt::registry::{CharacteristicRegistry, Feature};
pub use host::{
    HostCapability, HostError, HostEvent, HostEventSink, LinkHandle, LinkPriority, WriteMode,
    GATT_SUCCESS,
};
pub use manager::BleManager;
pub use scanner::assist::AssistScanner;
pub use scanner::duty_cycle::{
    DutyCycledScanner, ScanBackend, ScanConfig, ScanListener, ScannerError, ScannerHandle,
    ScannerState, ScannerStatus,
};
pub use session::device::{BleDevice, DeviceStatus, SessionObserver};
pub use session::guardian::{GuardianPolicy, GuardianStatus};
pub use session::task::{Priority, WriteRequest};
pub use session::{ConnectionState, DisconnectReason, SessionEvent};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Stable numeric codes carried by `SessionEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    RadioUnsupported = 1,
    RadioDisabled = 2,
    PermissionDenied = 3,
    DeviceNotFound = 4,
    ConnectionFailed = 5,
    ServiceNotFound = 6,
    CharacteristicNotFound = 7,
    OperationFailed = 8,
    Timeout = 9,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Radio unavailable")]
    CapabilityUnavailable,
    #[error("Connection attempt timed out")]
    ConnectionTimeout,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Service discovery failed with status {0}")]
    DiscoveryFailed(i32),
    #[error("Operation timed out")]
    OperationTimeout,
    #[error("Operation failed with status {0}")]
    OperationFailed(i32),
    #[error("Characteristic not found: {0}")]
    NotFound(Uuid),
    #[error("Session not ready (state: {0})")]
    NotReady(ConnectionState),
    #[error("Characteristic {characteristic} does not support {operation}")]
    Unsupported {
        characteristic: Uuid,
        operation: &'static str,
    },
    #[error("Session closed")]
    Closed,
}

impl BleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BleError::Configuration(ConfigError::InvalidAddress(_)) => ErrorCode::DeviceNotFound,
            BleError::Configuration(_) => ErrorCode::OperationFailed,
            BleError::CapabilityUnavailable => ErrorCode::RadioDisabled,
            BleError::ConnectionTimeout | BleError::OperationTimeout => ErrorCode::Timeout,
            BleError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            BleError::DiscoveryFailed(_) => ErrorCode::ServiceNotFound,
            BleError::NotFound(_) => ErrorCode::CharacteristicNotFound,
            BleError::OperationFailed(_)
            | BleError::NotReady(_)
            | BleError::Unsupported { .. }
            | BleError::Closed => ErrorCode::OperationFailed,
        }
    }
}

// ============================================================================
// LOGGING
// ============================================================================

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(BleError::CapabilityUnavailable.code().as_i32(), 2);
        assert_eq!(BleError::ConnectionTimeout.code().as_i32(), 9);
        assert_eq!(BleError::OperationTimeout.code(), ErrorCode::Timeout);
        assert_eq!(
            BleError::NotFound(Uuid::nil()).code(),
            ErrorCode::CharacteristicNotFound
        );
        assert_eq!(BleError::DiscoveryFailed(129).code().as_i32(), 6);
    }

    #[test]
    fn test_config_error_converts() {
        let err: BleError = ConfigError::InvalidAddress("nope".into()).into();
        assert_eq!(err.code(), ErrorCode::DeviceNotFound);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_bad_settings_are_not_reported_as_missing_device() {
        let mtu: BleError = ConfigError::InvalidMtu(10).into();
        assert_eq!(mtu.code(), ErrorCode::OperationFailed);
        let timeout: BleError = ConfigError::InvalidDuration("connection_timeout_ms").into();
        assert_eq!(timeout.code(), ErrorCode::OperationFailed);
    }

    #[test]
    fn test_not_ready_message_names_state() {
        let err = BleError::NotReady(ConnectionState::Connecting);
        assert_eq!(err.to_string(), "Session not ready (state: Connecting)");
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
