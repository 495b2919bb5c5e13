//! Characteristic identity table and the per-session discovered table.

use super::descriptor::{short_text, uuid_from_u16, CharacteristicDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const COMMON_GET: Uuid = uuid_from_u16(0xfda1);
pub const COMMON_POST: Uuid = uuid_from_u16(0xfda2);
pub const COMMON_PUSH: Uuid = uuid_from_u16(0xfda3);

pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2a19);
pub const SYSTEM_ID: Uuid = uuid_from_u16(0x2a23);
pub const MODEL_NUMBER: Uuid = uuid_from_u16(0x2a24);
pub const SERIAL_NUMBER: Uuid = uuid_from_u16(0x2a25);
pub const FIRMWARE_REVISION: Uuid = uuid_from_u16(0x2a26);
pub const HARDWARE_REVISION: Uuid = uuid_from_u16(0x2a27);
pub const SOFTWARE_REVISION: Uuid = uuid_from_u16(0x2a28);
pub const MANUFACTURER_NAME: Uuid = uuid_from_u16(0x2a29);

pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180d);
pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2a37);
pub const CSC_SERVICE: Uuid = uuid_from_u16(0x1816);
pub const CSC_MEASUREMENT: Uuid = uuid_from_u16(0x2a5b);
pub const CYCLING_POWER_SERVICE: Uuid = uuid_from_u16(0x1818);
pub const CYCLING_POWER_MEASUREMENT: Uuid = uuid_from_u16(0x2a63);

/// Semantic tag of a well-known characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    CommonGet,
    CommonPost,
    CommonPush,
    Battery,
    ModelNumber,
    SerialNumber,
    FirmwareVersion,
    HardwareVersion,
    SoftwareVersion,
    ManufacturerName,
    SystemId,
    /// Carries the identifier's short form, e.g. `2A37`
    Unknown(String),
}

impl Feature {
    pub fn identify(uuid: &Uuid) -> Self {
        match *uuid {
            COMMON_GET => Feature::CommonGet,
            COMMON_POST => Feature::CommonPost,
            COMMON_PUSH => Feature::CommonPush,
            BATTERY_LEVEL => Feature::Battery,
            MODEL_NUMBER => Feature::ModelNumber,
            SERIAL_NUMBER => Feature::SerialNumber,
            FIRMWARE_REVISION => Feature::FirmwareVersion,
            HARDWARE_REVISION => Feature::HardwareVersion,
            SOFTWARE_REVISION => Feature::SoftwareVersion,
            MANUFACTURER_NAME => Feature::ManufacturerName,
            SYSTEM_ID => Feature::SystemId,
            other => Feature::Unknown(short_text(&other)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Feature::CommonGet => "common get command",
            Feature::CommonPost => "common post command",
            Feature::CommonPush => "common push message",
            Feature::Battery => "battery level",
            Feature::ModelNumber => "model number",
            Feature::SerialNumber => "serial number",
            Feature::FirmwareVersion => "firmware version",
            Feature::HardwareVersion => "hardware version",
            Feature::SoftwareVersion => "software version",
            Feature::ManufacturerName => "manufacturer name",
            Feature::SystemId => "system id",
            Feature::Unknown(_) => "unknown",
        }
    }

    /// Device-information characteristics carrying a UTF-8 string.
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            Feature::ModelNumber
                | Feature::SerialNumber
                | Feature::FirmwareVersion
                | Feature::HardwareVersion
                | Feature::SoftwareVersion
                | Feature::ManufacturerName
        )
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Unknown(short) => write!(f, "unknown ({})", short),
            known => f.write_str(known.label()),
        }
    }
}

/// Characteristics found by the last discovery on one link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacteristicRegistry {
    entries: Vec<CharacteristicDescriptor>,
}

impl CharacteristicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with a fresh discovery result.
    pub fn replace(&mut self, characteristics: Vec<CharacteristicDescriptor>) {
        self.entries = characteristics;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn all(&self) -> &[CharacteristicDescriptor] {
        &self.entries
    }

    pub fn find(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.entries.iter().find(|c| c.uuid == *uuid)
    }

    pub fn readable(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.entries.iter().find(|c| c.uuid == *uuid && c.can_read)
    }

    pub fn writable(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.entries.iter().find(|c| c.uuid == *uuid && c.is_writable())
    }

    pub fn subscribable(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.entries
            .iter()
            .find(|c| c.uuid == *uuid && c.is_subscribable())
    }

    /// Every characteristic that can notify or indicate, in discovery order.
    pub fn subscribable_all(&self) -> impl Iterator<Item = &CharacteristicDescriptor> {
        self.entries.iter().filter(|c| c.is_subscribable())
    }
}
