//! Heart-rate measurement payload decoder.
//!
//! Layout: one flags byte, then the measurement (u8 or u16 LE), an optional
//! u16 LE energy-expended field, and an optional run of u16 LE RR intervals in
//! 1/1024 s units.

use serde::Serialize;

const FLAG_VALUE_U16: u8 = 0x01;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorContact {
    /// Flags bits 1-2 = 00 (01 is reserved and treated the same way)
    NotSupported,
    /// Bits 1-2 = 10
    NotDetected,
    /// Bits 1-2 = 11
    Detected,
}

impl SensorContact {
    fn from_flags(flags: u8) -> Self {
        match (flags >> 1) & 0x03 {
            0b11 => SensorContact::Detected,
            0b00 => SensorContact::NotSupported,
            _ => SensorContact::NotDetected,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, SensorContact::NotSupported)
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, SensorContact::Detected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    /// Measurement was sent as u16
    pub wide_format: bool,
    pub sensor_contact: SensorContact,
    pub energy_expended_kj: Option<u16>,
    pub rr_intervals_ms: Vec<f64>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let value = *self.bytes.get(self.offset)?;
        self.offset += 1;
        Some(value)
    }

    fn u16_le(&mut self) -> Option<u16> {
        let pair = self.bytes.get(self.offset..self.offset + 2)?;
        self.offset += 2;
        Some(u16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Decode a measurement. `None` when the buffer is shorter than its flags
/// require; a dangling odd byte in the RR list is ignored.
pub fn decode_heart_rate(bytes: &[u8]) -> Option<HeartRateMeasurement> {
    let mut reader = Reader { bytes, offset: 0 };
    let flags = reader.u8()?;

    let wide_format = flags & FLAG_VALUE_U16 != 0;
    let bpm = if wide_format {
        reader.u16_le()?
    } else {
        reader.u8()? as u16
    };

    let energy_expended_kj = if flags & FLAG_ENERGY_EXPENDED != 0 {
        Some(reader.u16_le()?)
    } else {
        None
    };

    let mut rr_intervals_ms = Vec::new();
    if flags & FLAG_RR_INTERVALS != 0 {
        while let Some(raw) = reader.u16_le() {
            rr_intervals_ms.push(raw as f64 * 1000.0 / 1024.0);
        }
    }

    Some(HeartRateMeasurement {
        bpm,
        wide_format,
        sensor_contact: SensorContact::from_flags(flags),
        energy_expended_kj,
        rr_intervals_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_u8_value() {
        let m = decode_heart_rate(&[0x00, 0x50]).unwrap();
        assert_eq!(m.bpm, 80);
        assert!(!m.wide_format);
        assert_eq!(m.sensor_contact, SensorContact::NotSupported);
        assert!(m.rr_intervals_ms.is_empty());
        assert_eq!(m.energy_expended_kj, None);
    }

    #[test]
    fn test_decode_u16_value_and_contact() {
        let m = decode_heart_rate(&[0x07, 0x2c, 0x01]).unwrap();
        assert_eq!(m.bpm, 300);
        assert!(m.wide_format);
        assert!(m.sensor_contact.is_detected());

        let m = decode_heart_rate(&[0x04, 0x48]).unwrap();
        assert!(m.sensor_contact.is_supported());
        assert!(!m.sensor_contact.is_detected());
    }

    #[test]
    fn test_decode_rr_interval_little_endian() {
        let m = decode_heart_rate(&[0x10, 0x46, 0x04, 0x00]).unwrap();
        assert_eq!(m.bpm, 70);
        assert_eq!(m.rr_intervals_ms.len(), 1);
        assert!((m.rr_intervals_ms[0] - 3.90625).abs() < 1e-9);

        let m = decode_heart_rate(&[0x10, 0x46, 0x00, 0x04]).unwrap();
        assert!((m.rr_intervals_ms[0] - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_energy_then_rr() {
        let m = decode_heart_rate(&[0x18, 0x3c, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02]).unwrap();
        assert_eq!(m.energy_expended_kj, Some(16));
        assert_eq!(m.rr_intervals_ms, vec![1000.0, 500.0]);
    }

    #[test]
    fn test_dangling_rr_byte_ignored() {
        let m = decode_heart_rate(&[0x10, 0x46, 0x00, 0x04, 0x01]).unwrap();
        assert_eq!(m.rr_intervals_ms.len(), 1);
    }

    #[test]
    fn test_short_buffers_fail() {
        assert!(decode_heart_rate(&[]).is_none());
        assert!(decode_heart_rate(&[0x00]).is_none());
        assert!(decode_heart_rate(&[0x01, 0x50]).is_none());
        assert!(decode_heart_rate(&[0x08, 0x50, 0x01]).is_none());
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
            let _ = decode_heart_rate(&bytes);
        }
    }
}
