//! Per-device session: state machine, operation queue, reconnection policy
//! and the actor that confines them.

pub mod connector;
pub mod device;
pub mod guardian;
pub mod queue;
pub mod task;

use crate::config::DeviceAddress;
use crate::gatt::descriptor::CharacteristicDescriptor;
use crate::gatt::registry::CharacteristicRegistry;
use crate::host::GATT_SUCCESS;
use crate::BleError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Connection state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Link is up, discovery not started yet
    Connected,
    DiscoveringServices,
    /// Services known, operations accepted
    Ready,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::DiscoveringServices => "DiscoveringServices",
            ConnectionState::Ready => "Ready",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// `disconnect()` or `close()` was called
    UserRequest,
    /// Peer or stack ended an established link cleanly
    DeviceDisconnect,
    /// Link dropped before it was ever established
    ConnectFailed,
    /// Connect-phase deadline elapsed
    Timeout,
    /// Link reported a non-success status
    LinkError,
}

impl DisconnectReason {
    /// Classify a link-down report.
    pub fn classify(user_requested: bool, connect_phase: bool, status: i32) -> Self {
        if user_requested {
            DisconnectReason::UserRequest
        } else if connect_phase {
            DisconnectReason::ConnectFailed
        } else if status != GATT_SUCCESS {
            DisconnectReason::LinkError
        } else {
            DisconnectReason::DeviceDisconnect
        }
    }
}

/// Events delivered to every registered observer of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        state: ConnectionState,
        /// Peer address while a link exists
        peer: Option<DeviceAddress>,
    },
    Disconnected {
        reason: DisconnectReason,
        status: i32,
        connect_phase: bool,
    },
    ServicesDiscovered(Vec<CharacteristicDescriptor>),
    MtuChanged(u16),
    Notification {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ReadComplete {
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        success: bool,
    },
    WriteComplete {
        characteristic: Uuid,
        success: bool,
    },
    NotificationEnabled {
        characteristic: Uuid,
        enabled: bool,
        success: bool,
    },
    Error(BleError),
    RadioAvailabilityChanged(bool),
}

/// What a caller wants to do with a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    Notify,
    Indicate,
}

impl Access {
    fn label(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Notify => "notification",
            Access::Indicate => "indication",
        }
    }

    fn allowed(self, descriptor: &CharacteristicDescriptor) -> bool {
        match self {
            Access::Read => descriptor.can_read,
            Access::Write => descriptor.is_writable(),
            Access::Notify => descriptor.can_notify,
            Access::Indicate => descriptor.can_indicate,
        }
    }
}

/// Reject a request before it reaches the queue: the session must be
/// ready and the characteristic must exist with the needed capability.
pub(crate) fn resolve_target<'a>(
    state: ConnectionState,
    registry: &'a CharacteristicRegistry,
    characteristic: &Uuid,
    access: Access,
) -> Result<&'a CharacteristicDescriptor, BleError> {
    if state != ConnectionState::Ready {
        return Err(BleError::NotReady(state));
    }
    let descriptor = registry
        .find(characteristic)
        .ok_or(BleError::NotFound(*characteristic))?;
    if !access.allowed(descriptor) {
        return Err(BleError::Unsupported {
            characteristic: *characteristic,
            operation: access.label(),
        });
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::descriptor::{properties, uuid_from_u16};

    #[test]
    fn test_classify_disconnect() {
        assert_eq!(
            DisconnectReason::classify(true, true, 133),
            DisconnectReason::UserRequest
        );
        assert_eq!(
            DisconnectReason::classify(false, true, 0),
            DisconnectReason::ConnectFailed
        );
        assert_eq!(
            DisconnectReason::classify(false, false, 8),
            DisconnectReason::LinkError
        );
        assert_eq!(
            DisconnectReason::classify(false, false, GATT_SUCCESS),
            DisconnectReason::DeviceDisconnect
        );
    }

    #[test]
    fn test_resolve_target() {
        let uuid = uuid_from_u16(0x2a19);
        let mut registry = CharacteristicRegistry::new();
        registry.replace(vec![CharacteristicDescriptor::from_properties(
            uuid_from_u16(0x180f),
            uuid,
            properties::READ | properties::NOTIFY,
        )]);

        assert_eq!(
            resolve_target(ConnectionState::Connecting, &registry, &uuid, Access::Read),
            Err(BleError::NotReady(ConnectionState::Connecting))
        );
        assert!(resolve_target(ConnectionState::Ready, &registry, &uuid, Access::Read).is_ok());
        assert!(resolve_target(ConnectionState::Ready, &registry, &uuid, Access::Notify).is_ok());
        assert_eq!(
            resolve_target(ConnectionState::Ready, &registry, &uuid, Access::Write),
            Err(BleError::Unsupported {
                characteristic: uuid,
                operation: "write"
            })
        );
        let missing = uuid_from_u16(0x2a00);
        assert_eq!(
            resolve_target(ConnectionState::Ready, &registry, &missing, Access::Read),
            Err(BleError::NotFound(missing))
        );
    }
}
