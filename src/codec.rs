//! Frame codec for the fixed-width firmware packets.
//!
//! [`PacketCodec`] is configured once per session with the active
//! [`PacketLayout`] and [`Framing`]. It never guesses the variant: a frame
//! whose size does not match the layout is rejected whole.
//!
//! ```rust
//! use drumlink::codec::PacketCodec;
//! use drumlink::types::{PacketLayout, RawFrame, ReceptionClock};
//!
//! let codec = PacketCodec::binary(PacketLayout::sequenced(&["ch2", "ch3"]));
//! let bytes = codec.encode(7, 70, &[8192, 100]).unwrap();
//! let sample = codec.decode(&RawFrame::new(bytes, ReceptionClock::new().now())).unwrap();
//! assert_eq!(sample.sequence, Some(7));
//! assert_eq!(sample.raw("ch3"), Some(100));
//! ```

use std::sync::Arc;

use crate::error::DecodeError;
use crate::types::{
    DecodedSample, FIELD_BYTES, Framing, HEADER_BYTES, PacketLayout, RawFrame, Reading,
};

/// Stateless decoder/encoder for one layout.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    layout: Arc<PacketLayout>,
    framing: Framing,
}

impl PacketCodec {
    pub fn new(layout: PacketLayout, framing: Framing) -> Self {
        Self { layout: Arc::new(layout), framing }
    }

    /// Codec for little-endian binary frames.
    pub fn binary(layout: PacketLayout) -> Self {
        Self::new(layout, Framing::Binary)
    }

    /// Codec for comma-separated text frames.
    pub fn text(layout: PacketLayout) -> Self {
        Self::new(layout, Framing::Text)
    }

    pub fn layout(&self) -> &Arc<PacketLayout> {
        &self.layout
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Expected frame size in this codec's unit (bytes or values).
    pub fn expected_len(&self) -> usize {
        match self.framing {
            Framing::Binary => self.layout.frame_len(),
            Framing::Text => self.layout.text_len(),
        }
    }

    /// Decode one frame.
    pub fn decode(&self, frame: &RawFrame) -> Result<DecodedSample, DecodeError> {
        let (sequence, device_ms, raws) = match self.framing {
            Framing::Binary => self.unpack_binary(&frame.data)?,
            Framing::Text => self.unpack_text(&frame.data)?,
        };

        let readings =
            raws.into_iter().enumerate().map(|(field, raw)| Reading { field, raw }).collect();

        Ok(DecodedSample {
            sequence,
            device_ms,
            received_at: frame.received_at,
            readings,
            layout: Arc::clone(&self.layout),
        })
    }

    /// Encode one frame; the header values are ignored when the layout has none.
    pub fn encode(
        &self,
        sequence: u32,
        device_ms: u32,
        values: &[u16],
    ) -> Result<Vec<u8>, DecodeError> {
        if values.len() != self.layout.fields.len() {
            return Err(DecodeError::LengthMismatch {
                expected: self.layout.fields.len(),
                actual: values.len(),
                unit: "values",
            });
        }

        match self.framing {
            Framing::Binary => {
                let mut out = Vec::with_capacity(self.layout.frame_len());
                if self.layout.sequence_header {
                    out.extend_from_slice(&sequence.to_le_bytes());
                    out.extend_from_slice(&device_ms.to_le_bytes());
                }
                for value in values {
                    out.extend_from_slice(&value.to_le_bytes());
                }
                Ok(out)
            }
            Framing::Text => {
                let mut parts: Vec<String> = Vec::with_capacity(self.layout.text_len());
                if self.layout.sequence_header {
                    parts.push(sequence.to_string());
                    parts.push(device_ms.to_string());
                }
                parts.extend(values.iter().map(u16::to_string));
                Ok(parts.join(",").into_bytes())
            }
        }
    }

    fn unpack_binary(
        &self,
        data: &[u8],
    ) -> Result<(Option<u32>, Option<u32>, Vec<u16>), DecodeError> {
        let expected = self.layout.frame_len();
        if data.len() != expected {
            return Err(DecodeError::LengthMismatch {
                expected,
                actual: data.len(),
                unit: "bytes",
            });
        }

        let (sequence, device_ms, body) = if self.layout.sequence_header {
            (Some(read_u32(data, 0, "seq")?), Some(read_u32(data, 4, "ms")?), &data[HEADER_BYTES..])
        } else {
            (None, None, data)
        };

        let raws = self
            .layout
            .fields
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let offset = i * FIELD_BYTES;
                body.get(offset..offset + FIELD_BYTES)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .ok_or_else(|| DecodeError::FieldUnpack {
                        field: field.name.clone(),
                        reason: format!("offset {offset} out of bounds"),
                    })
            })
            .collect::<Result<Vec<u16>, DecodeError>>()?;

        Ok((sequence, device_ms, raws))
    }

    fn unpack_text(
        &self,
        data: &[u8],
    ) -> Result<(Option<u32>, Option<u32>, Vec<u16>), DecodeError> {
        let line = std::str::from_utf8(data).map_err(|e| DecodeError::FieldUnpack {
            field: "line".to_string(),
            reason: e.to_string(),
        })?;
        let parts: Vec<&str> = line.trim().split(',').map(str::trim).collect();

        let expected = self.layout.text_len();
        if parts.len() != expected {
            return Err(DecodeError::LengthMismatch {
                expected,
                actual: parts.len(),
                unit: "values",
            });
        }

        let (sequence, device_ms, body) = if self.layout.sequence_header {
            (Some(parse_field::<u32>(parts[0], "seq")?), Some(parse_field::<u32>(parts[1], "ms")?), &parts[2..])
        } else {
            (None, None, &parts[..])
        };

        let raws = self
            .layout
            .fields
            .iter()
            .zip(body)
            .map(|(field, text)| parse_field::<u16>(text, &field.name))
            .collect::<Result<Vec<u16>, DecodeError>>()?;

        Ok((sequence, device_ms, raws))
    }
}

fn read_u32(data: &[u8], offset: usize, field: &str) -> Result<u32, DecodeError> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DecodeError::FieldUnpack {
            field: field.to_string(),
            reason: format!("offset {offset} out of bounds"),
        })
}

fn parse_field<T>(text: &str, field: &str) -> Result<T, DecodeError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    text.parse::<T>().map_err(|e| DecodeError::FieldUnpack {
        field: field.to_string(),
        reason: format!("'{text}': {e}"),
    })
}
