//! Binary payload codecs.

pub mod advertisement;
pub mod heart_rate;

use crate::gatt::registry::{Feature, HEART_RATE_MEASUREMENT};
use heart_rate::HeartRateMeasurement;
use serde::Serialize;
use uuid::Uuid;

/// A characteristic value decoded through the identity table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KnownValue {
    /// Percent, 0-100
    BatteryLevel(u8),
    /// Device-information string
    Text(String),
    /// System id, rendered as upper-case hex
    SystemId(String),
    HeartRate(HeartRateMeasurement),
}

/// Decode `value` read from or pushed by `characteristic`, when the
/// characteristic is one we understand.
pub fn decode_known(characteristic: &Uuid, value: &[u8]) -> Option<KnownValue> {
    if *characteristic == HEART_RATE_MEASUREMENT {
        return heart_rate::decode_heart_rate(value).map(KnownValue::HeartRate);
    }

    match Feature::identify(characteristic) {
        Feature::Battery => value.first().map(|level| KnownValue::BatteryLevel(*level)),
        Feature::SystemId if !value.is_empty() => {
            Some(KnownValue::SystemId(hex::encode_upper(value)))
        }
        feature if feature.is_text() => {
            let text = String::from_utf8_lossy(value);
            Some(KnownValue::Text(text.trim_end_matches('\0').to_string()))
        }
        _ => None,
    }
}
