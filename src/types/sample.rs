//! Decoded sample types

use std::sync::Arc;

use super::{Calibration, PacketLayout, ReceptionTime};

/// One decoded channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    /// Index of the field in the session layout
    pub field: usize,
    /// Raw converter count
    pub raw: u16,
}

/// A frame decoded against the session layout.
///
/// Readings are stored in wire order; field and channel names are resolved
/// through the shared layout so decoding allocates one `Vec` per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    /// Producer-assigned counter, when the layout carries a header
    pub sequence: Option<u32>,

    /// Producer milliseconds since boot, when the layout carries a header
    pub device_ms: Option<u32>,

    /// Receiver-assigned stamp
    pub received_at: ReceptionTime,

    /// Channel readings in wire order
    pub readings: Vec<Reading>,

    /// Layout the sample was decoded with
    pub layout: Arc<PacketLayout>,
}

impl DecodedSample {
    /// Raw value of a field by name.
    pub fn raw(&self, field: &str) -> Option<u16> {
        let index = self.layout.field_index(field)?;
        self.readings.get(index).map(|r| r.raw)
    }

    /// Raw values in wire order.
    pub fn raw_values(&self) -> Vec<u16> {
        self.readings.iter().map(|r| r.raw).collect()
    }

    /// Name of the field a reading came from.
    pub fn field_name(&self, reading: &Reading) -> &str {
        &self.layout.fields[reading.field].name
    }

    /// Logical channel a reading feeds.
    pub fn channel_name(&self, reading: &Reading) -> &str {
        &self.layout.fields[reading.field].channel
    }

    /// Iterate `(field name, raw)` pairs in wire order.
    pub fn named(&self) -> impl Iterator<Item = (&str, u16)> + '_ {
        self.readings.iter().map(|r| (self.field_name(r), r.raw))
    }

    /// Volts of every reading in wire order.
    pub fn volts(&self, calibration: &Calibration) -> Vec<f64> {
        self.readings.iter().map(|r| calibration.volts(r.raw)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReceptionClock;

    #[test]
    fn lookup_by_name() {
        let layout = Arc::new(PacketLayout::four_channel());
        let sample = DecodedSample {
            sequence: None,
            device_ms: None,
            received_at: ReceptionClock::new().now(),
            readings: vec![
                Reading { field: 0, raw: 1 },
                Reading { field: 1, raw: 2 },
                Reading { field: 2, raw: 3 },
                Reading { field: 3, raw: 4 },
            ],
            layout,
        };
        assert_eq!(sample.raw("ch3"), Some(3));
        assert_eq!(sample.raw("ch9"), None);
        assert_eq!(sample.raw_values(), vec![1, 2, 3, 4]);
        let names: Vec<&str> = sample.named().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["ch0", "ch2", "ch3", "ch4"]);
        assert_eq!(sample.volts(&Calibration::default()).len(), 4);
    }
}
