//! Advertisement record parser
//!
//! A scan payload is a run of `[len:1][type:1][payload:len-1]` structures.
//! Parsing stops at a zero length or at the first structure that would run
//! past the end of the buffer; whatever was decoded up to that point is kept.

use crate::gatt::descriptor::{uuid_from_u16, uuid_from_u32};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

const TYPE_16BIT_UUIDS_INCOMPLETE: u8 = 0x02;
const TYPE_16BIT_UUIDS_COMPLETE: u8 = 0x03;
const TYPE_32BIT_UUIDS_INCOMPLETE: u8 = 0x04;
const TYPE_32BIT_UUIDS_COMPLETE: u8 = 0x05;
const TYPE_128BIT_UUIDS_INCOMPLETE: u8 = 0x06;
const TYPE_128BIT_UUIDS_COMPLETE: u8 = 0x07;
const TYPE_LOCAL_NAME_SHORT: u8 = 0x08;
const TYPE_LOCAL_NAME_COMPLETE: u8 = 0x09;
const TYPE_TX_POWER_LEVEL: u8 = 0x0a;
const TYPE_SERVICE_DATA_16BIT: u8 = 0x16;
const TYPE_SERVICE_DATA_32BIT: u8 = 0x20;
const TYPE_SERVICE_DATA_128BIT: u8 = 0x21;
const TYPE_MANUFACTURER_DATA: u8 = 0xff;

/// Decoded advertisement fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdvertisementRecord {
    pub device_name: Option<String>,
    pub tx_power_level: Option<i8>,
    pub service_uuids: Vec<Uuid>,
    /// Keyed by the little-endian company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
}

/// Parse raw advertisement bytes. Never fails; malformed tails are dropped.
pub fn parse_advertisement(bytes: &[u8]) -> AdvertisementRecord {
    let mut record = AdvertisementRecord::default();
    let mut index = 0;

    while index < bytes.len() {
        let length = bytes[index] as usize;
        if length == 0 || index + 1 + length > bytes.len() {
            break;
        }
        let ad_type = bytes[index + 1];
        let payload = &bytes[index + 2..index + 1 + length];

        match ad_type {
            TYPE_LOCAL_NAME_SHORT | TYPE_LOCAL_NAME_COMPLETE => {
                if record.device_name.is_none() && !payload.is_empty() {
                    record.device_name = decode_name(payload);
                }
            }
            TYPE_TX_POWER_LEVEL => {
                if let Some(&level) = payload.first() {
                    record.tx_power_level = Some(level as i8);
                }
            }
            TYPE_16BIT_UUIDS_INCOMPLETE | TYPE_16BIT_UUIDS_COMPLETE => {
                record
                    .service_uuids
                    .extend(payload.chunks_exact(2).map(uuid16));
            }
            TYPE_32BIT_UUIDS_INCOMPLETE | TYPE_32BIT_UUIDS_COMPLETE => {
                record
                    .service_uuids
                    .extend(payload.chunks_exact(4).map(uuid32));
            }
            TYPE_128BIT_UUIDS_INCOMPLETE | TYPE_128BIT_UUIDS_COMPLETE => {
                record
                    .service_uuids
                    .extend(payload.chunks_exact(16).map(uuid128));
            }
            TYPE_MANUFACTURER_DATA if payload.len() >= 2 => {
                let company = u16::from_le_bytes([payload[0], payload[1]]);
                record
                    .manufacturer_data
                    .insert(company, payload[2..].to_vec());
            }
            TYPE_SERVICE_DATA_16BIT if payload.len() >= 2 => {
                record
                    .service_data
                    .insert(uuid16(&payload[..2]), payload[2..].to_vec());
            }
            TYPE_SERVICE_DATA_32BIT if payload.len() >= 4 => {
                record
                    .service_data
                    .insert(uuid32(&payload[..4]), payload[4..].to_vec());
            }
            TYPE_SERVICE_DATA_128BIT if payload.len() >= 16 => {
                record
                    .service_data
                    .insert(uuid128(&payload[..16]), payload[16..].to_vec());
            }
            _ => {}
        }

        index += 1 + length;
    }

    record
}

/// Only the local name, without decoding anything else.
pub fn parse_device_name(bytes: &[u8]) -> Option<String> {
    parse_advertisement(bytes).device_name
}

// Padding after the name (NULs, stray control bytes) is not part of it.
fn decode_name(payload: &[u8]) -> Option<String> {
    std::str::from_utf8(payload)
        .ok()
        .map(|name| name.trim_end_matches(|c: char| c.is_control()).to_string())
}

fn uuid16(bytes: &[u8]) -> Uuid {
    uuid_from_u16(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn uuid32(bytes: &[u8]) -> Uuid {
    uuid_from_u32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

// 128-bit UUIDs travel least-significant byte first.
fn uuid128(bytes: &[u8]) -> Uuid {
    let mut be = [0u8; 16];
    for (dst, src) in be.iter_mut().zip(bytes.iter().rev()) {
        *dst = *src;
    }
    Uuid::from_bytes(be)
}
