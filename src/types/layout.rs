//! Wire layout descriptions for the deployed firmware variants

use serde::{Deserialize, Serialize};

use crate::{Result, TelemetryError};

/// Size of one channel field on the wire.
pub const FIELD_BYTES: usize = 2;

/// Size of the optional `u32 seq, u32 ms` header.
pub const HEADER_BYTES: usize = 8;

/// How a link frames its payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Little-endian fixed-width binary (BLE notifications, replay captures)
    #[default]
    Binary,
    /// Comma-separated decimal text lines (the serial bridge)
    Text,
}

/// One `u16` field in a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Column/field name, unique within the layout (e.g. `ch2`, `a0_3`)
    pub name: String,
    /// Logical channel the field feeds (e.g. `ch2`, `a0`)
    pub channel: String,
}

impl FieldSpec {
    /// A field that is its own channel.
    pub fn single(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { channel: name.clone(), name }
    }
}

/// Static description of one firmware variant's frame.
///
/// Chosen once per session; the codec never auto-detects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketLayout {
    /// Whether the frame starts with the firmware's `u32 seq, u32 ms` header
    #[serde(default)]
    pub sequence_header: bool,
    /// Channel fields in wire order
    pub fields: Vec<FieldSpec>,
}

impl PacketLayout {
    /// Build and validate a layout.
    pub fn new(sequence_header: bool, fields: Vec<FieldSpec>) -> Result<Self> {
        let layout = Self { sequence_header, fields };
        layout.validate()?;
        Ok(layout)
    }

    /// `[ch0, ch2, ch3, ch4]`, no header.
    pub fn four_channel() -> Self {
        Self::from_names(false, &["ch0", "ch2", "ch3", "ch4"])
    }

    /// `[ch0, ch1, ch2, ch3, ch4]`, no header.
    pub fn five_channel() -> Self {
        Self::from_names(false, &["ch0", "ch1", "ch2", "ch3", "ch4"])
    }

    /// Two 5-sample bursts per notification: `a0_0..a0_4, a1_0..a1_4`.
    pub fn dual_burst() -> Self {
        let fields = ["a0", "a1"]
            .iter()
            .flat_map(|channel| {
                (0..5).map(move |i| FieldSpec {
                    name: format!("{channel}_{i}"),
                    channel: (*channel).to_string(),
                })
            })
            .collect();
        Self { sequence_header: false, fields }
    }

    /// Firmware variant that prefixes `seq, ms` before the named fields.
    pub fn sequenced(names: &[&str]) -> Self {
        Self::from_names(true, names)
    }

    fn from_names(sequence_header: bool, names: &[&str]) -> Self {
        Self { sequence_header, fields: names.iter().map(|n| FieldSpec::single(*n)).collect() }
    }

    /// Reject empty layouts and duplicate field names.
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(TelemetryError::config("packet layout has no fields"));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() || field.channel.is_empty() {
                return Err(TelemetryError::config(format!("field {i} has an empty name")));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(TelemetryError::config(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Exact binary frame size in bytes.
    pub fn frame_len(&self) -> usize {
        let header = if self.sequence_header { HEADER_BYTES } else { 0 };
        header + self.fields.len() * FIELD_BYTES
    }

    /// Number of comma-separated values in a text frame.
    pub fn text_len(&self) -> usize {
        let header = if self.sequence_header { 2 } else { 0 };
        header + self.fields.len()
    }

    /// Position of a field by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Logical channels in first-appearance order.
    pub fn channels(&self) -> Vec<&str> {
        let mut channels: Vec<&str> = Vec::new();
        for field in &self.fields {
            if !channels.contains(&field.channel.as_str()) {
                channels.push(&field.channel);
            }
        }
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_sizes() {
        assert_eq!(PacketLayout::four_channel().frame_len(), 8);
        assert_eq!(PacketLayout::five_channel().frame_len(), 10);
        assert_eq!(PacketLayout::dual_burst().frame_len(), 20);
        // "<IIHHH" on the Feather V2 firmware
        assert_eq!(PacketLayout::sequenced(&["ch0", "ch2", "ch3"]).frame_len(), 14);
        assert_eq!(PacketLayout::sequenced(&["ch0", "ch2", "ch3"]).text_len(), 5);
    }

    #[test]
    fn burst_channels_group_fields() {
        let layout = PacketLayout::dual_burst();
        assert_eq!(layout.channels(), vec!["a0", "a1"]);
        assert_eq!(layout.field_index("a1_0"), Some(5));
        assert_eq!(layout.fields[4].channel, "a0");
    }

    #[test]
    fn rejects_bad_layouts() {
        assert!(PacketLayout::new(false, vec![]).is_err());
        assert!(
            PacketLayout::new(false, vec![FieldSpec::single("ch2"), FieldSpec::single("ch2")])
                .is_err()
        );
        assert!(PacketLayout::new(true, vec![FieldSpec::single("ch2")]).is_ok());
    }
}
