//! Core types for telemetry data representation.
//!
//! This module provides the data structures that flow through the pipeline:
//! - [`RawFrame`] is one payload exactly as a link delivered it, stamped with a
//!   [`ReceptionTime`] from a monotonic [`ReceptionClock`]
//! - [`PacketLayout`] describes a firmware variant's fixed-width frame
//! - [`DecodedSample`] holds the raw readings decoded against a layout
//! - [`Calibration`] and [`raw_to_volts`] convert counts to volts
//! - [`SequenceTracker`] accounts for lost and reordered frames
//! - [`ConnectionState`] names the supervisor's states
//!
//! ## Usage Example
//!
//! ```rust
//! use drumlink::types::{raw_to_volts, PacketLayout};
//!
//! let layout = PacketLayout::sequenced(&["ch0", "ch2", "ch3"]);
//! assert_eq!(layout.frame_len(), 14);
//!
//! // Half scale in the bipolar range is 0 V.
//! assert!(raw_to_volts(8192, 4, 4.096).abs() < 1e-12);
//! ```

mod calibration;
mod frame;
mod layout;
mod sample;
mod sequence;
mod state;

pub use calibration::{Calibration, DEFAULT_INPUT_RANGE, DEFAULT_VREF, FULL_SCALE, raw_to_volts};
pub use frame::{RawFrame, ReceptionClock, ReceptionTime};
pub use layout::{FIELD_BYTES, FieldSpec, Framing, HEADER_BYTES, PacketLayout};
pub use sample::{DecodedSample, Reading};
pub use sequence::{LossSummary, SequenceStep, SequenceTracker, seq_after_u32};
pub use state::ConnectionState;
