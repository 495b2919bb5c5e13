//! Host radio capability boundary.
//!
//! The session never talks to a radio stack directly. It issues non-blocking
//! requests through [`HostCapability`]; results arrive later as [`HostEvent`]s
//! pushed into the [`HostEventSink`] handed over on `connect`, which posts
//! them onto the session's actor.

use crate::config::DeviceAddress;
use crate::gatt::descriptor::CharacteristicDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Status value hosts report for a successful completion.
pub const GATT_SUCCESS: i32 = 0;

/// Opaque identity of one physical link, minted by the host on `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkHandle(u64);

impl LinkHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::WithResponse => write!(f, "with-response"),
            WriteMode::WithoutResponse => write!(f, "without-response"),
        }
    }
}

/// Connection priority hint requested once a link comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkPriority {
    Balanced,
    High,
    LowPower,
}

/// Push-style callbacks from the host stack.
///
/// Every variant carries the handle it refers to; events for a handle the
/// session no longer owns are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    LinkStateChanged {
        handle: LinkHandle,
        status: i32,
        connected: bool,
    },
    ServicesDiscovered {
        handle: LinkHandle,
        status: i32,
        characteristics: Vec<CharacteristicDescriptor>,
    },
    MtuChanged {
        handle: LinkHandle,
        mtu: u16,
        status: i32,
    },
    /// Notification or indication value.
    CharacteristicChanged {
        handle: LinkHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicRead {
        handle: LinkHandle,
        characteristic: Uuid,
        value: Vec<u8>,
        status: i32,
    },
    /// Delivered for both write modes once the host has accepted the data.
    CharacteristicWrite {
        handle: LinkHandle,
        characteristic: Uuid,
        status: i32,
    },
    /// Completion of the remote half of `set_notification`.
    DescriptorWrite {
        handle: LinkHandle,
        characteristic: Uuid,
        status: i32,
    },
}

impl HostEvent {
    pub fn handle(&self) -> LinkHandle {
        match self {
            HostEvent::LinkStateChanged { handle, .. }
            | HostEvent::ServicesDiscovered { handle, .. }
            | HostEvent::MtuChanged { handle, .. }
            | HostEvent::CharacteristicChanged { handle, .. }
            | HostEvent::CharacteristicRead { handle, .. }
            | HostEvent::CharacteristicWrite { handle, .. }
            | HostEvent::DescriptorWrite { handle, .. } => *handle,
        }
    }
}

/// Where the host delivers [`HostEvent`]s for one link.
pub type HostEventSink = Arc<dyn Fn(HostEvent) + Send + Sync>;

/// Synchronous rejection of a host request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Radio unavailable")]
    RadioUnavailable,
    #[error("Unknown link handle {0}")]
    InvalidHandle(LinkHandle),
    #[error("Not found: {0}")]
    NotFound(Uuid),
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Non-blocking radio operations the session layer consumes.
///
/// Every request returns as soon as it has been handed to the stack; a
/// successful return means a matching [`HostEvent`] will follow.
#[cfg_attr(test, mockall::automock)]
pub trait HostCapability: Send + Sync {
    fn is_radio_enabled(&self) -> bool;

    fn connect(
        &self,
        address: &DeviceAddress,
        events: HostEventSink,
    ) -> Result<LinkHandle, HostError>;

    fn disconnect(&self, handle: LinkHandle);

    /// Release every resource held for `handle`. No further events follow.
    fn close(&self, handle: LinkHandle);

    fn request_connection_priority(&self, handle: LinkHandle, priority: LinkPriority);

    fn discover_services(&self, handle: LinkHandle) -> Result<(), HostError>;

    fn read_characteristic(
        &self,
        handle: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), HostError>;

    fn write_characteristic(
        &self,
        handle: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), HostError>;

    /// Register locally, then write the client configuration descriptor.
    fn set_notification(
        &self,
        handle: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
        indication: bool,
    ) -> Result<(), HostError>;

    fn request_mtu(&self, handle: LinkHandle, mtu: u16) -> Result<(), HostError>;
}
