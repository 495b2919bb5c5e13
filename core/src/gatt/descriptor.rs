//! Characteristic descriptors, UUID helpers and write-mode selection.

use crate::host::WriteMode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
pub const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit assigned number into the full base UUID form.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Expand a 32-bit assigned number into the full base UUID form.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Client characteristic configuration descriptor.
pub const CCCD_UUID: Uuid = uuid_from_u16(0x2902);

/// Upper-case characters 4..8 of the hyphenated form, e.g. `2A19`.
pub fn short_text(uuid: &Uuid) -> String {
    let text = uuid.hyphenated().to_string();
    text[4..8].to_ascii_uppercase()
}

/// GATT characteristic property bits.
pub mod properties {
    pub const READ: u8 = 0x02;
    pub const WRITE_NO_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

/// One characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    pub service: Uuid,
    pub uuid: Uuid,
    pub can_read: bool,
    /// Write with response
    pub can_write: bool,
    pub can_write_no_response: bool,
    pub can_notify: bool,
    pub can_indicate: bool,
}

impl CharacteristicDescriptor {
    pub fn from_properties(service: Uuid, uuid: Uuid, bits: u8) -> Self {
        Self {
            service,
            uuid,
            can_read: bits & properties::READ != 0,
            can_write: bits & properties::WRITE != 0,
            can_write_no_response: bits & properties::WRITE_NO_RESPONSE != 0,
            can_notify: bits & properties::NOTIFY != 0,
            can_indicate: bits & properties::INDICATE != 0,
        }
    }

    pub fn properties(&self) -> u8 {
        let mut bits = 0;
        if self.can_read {
            bits |= properties::READ;
        }
        if self.can_write {
            bits |= properties::WRITE;
        }
        if self.can_write_no_response {
            bits |= properties::WRITE_NO_RESPONSE;
        }
        if self.can_notify {
            bits |= properties::NOTIFY;
        }
        if self.can_indicate {
            bits |= properties::INDICATE;
        }
        bits
    }

    pub fn is_writable(&self) -> bool {
        self.can_write || self.can_write_no_response
    }

    pub fn is_subscribable(&self) -> bool {
        self.can_notify || self.can_indicate
    }

    pub fn supports(&self, mode: WriteMode) -> bool {
        match mode {
            WriteMode::WithResponse => self.can_write,
            WriteMode::WithoutResponse => self.can_write_no_response,
        }
    }
}

/// Pick the write mode for a single-payload write.
///
/// A supported caller preference wins. Otherwise without-response is
/// preferred, then with-response. `None` when the characteristic is not
/// writable at all.
pub fn select_write_mode(
    descriptor: &CharacteristicDescriptor,
    preference: Option<WriteMode>,
) -> Option<WriteMode> {
    match preference {
        Some(mode) if descriptor.supports(mode) => Some(mode),
        _ if descriptor.can_write_no_response => Some(WriteMode::WithoutResponse),
        _ if descriptor.can_write => Some(WriteMode::WithResponse),
        _ => None,
    }
}

/// Pick the write mode for a chunked transfer.
///
/// Chunks default to with-response so each one is acknowledged before the
/// next is sent; without-response is used only when asked for explicitly or
/// when it is the only mode available.
pub fn select_chunked_write_mode(
    descriptor: &CharacteristicDescriptor,
    preference: Option<WriteMode>,
) -> Option<WriteMode> {
    match preference {
        Some(mode) if descriptor.supports(mode) => Some(mode),
        _ if descriptor.can_write => Some(WriteMode::WithResponse),
        _ if descriptor.can_write_no_response => Some(WriteMode::WithoutResponse),
        _ => None,
    }
}
