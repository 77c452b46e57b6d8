//! Link transports
//!
//! A [`Transport`] finds and opens peripherals; the [`Link`] it returns
//! delivers raw payloads. Transports only move bytes: stamping, decoding and
//! routing stay in the supervisor, so every transport feeds the same codec
//! and router path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(feature = "ble")]
mod ble;
mod replay;
#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "ble")]
pub use ble::{BleLink, BleTransport};
pub use replay::{ReplayLink, ReplayTransport};
#[cfg(feature = "serial")]
pub use serial::{SerialLink, SerialTransport};

/// Telemetry characteristic of the drum firmware.
pub const DEFAULT_CHARACTERISTIC: &str = "c0de1000-0000-4a6f-9e00-000000000001";

/// Advertised name of the drum firmware.
pub const DEFAULT_DEVICE_NAME: &str = "ESP32-Analog-100Hz";

/// How the supervisor picks a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTarget {
    /// Scan for an advertised name.
    Name(String),
    /// Connect to a known address, port or file without scanning.
    Address(String),
}

impl Default for DeviceTarget {
    fn default() -> Self {
        DeviceTarget::Name(DEFAULT_DEVICE_NAME.to_string())
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTarget::Name(name) => write!(f, "name '{name}'"),
            DeviceTarget::Address(address) => write!(f, "address '{address}'"),
        }
    }
}

/// A discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    /// Transport-specific address (BLE address, serial port, file path)
    pub address: String,
    /// Advertised name, when known
    pub name: Option<String>,
}

impl Peripheral {
    pub fn at(address: impl Into<String>) -> Self {
        Self { address: address.into(), name: None }
    }
}

/// What a link handed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One payload exactly as received.
    Frame(Vec<u8>),
    /// The peer went away; the supervisor reconnects.
    Disconnected,
    /// The source is exhausted; the supervisor stops.
    Finished,
}

/// Trait for peripheral discovery and connection
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    type Link: Link;

    /// Look for a peripheral advertising `name`.
    ///
    /// Returns:
    /// - `Ok(Some(peripheral))` - Found
    /// - `Ok(None)` - Scan finished without a match
    /// - `Err(e)` - The adapter itself failed
    ///
    /// The supervisor bounds this call with its discovery timeout.
    async fn discover(&mut self, name: &str) -> Result<Option<Peripheral>>;

    /// Open a link to a peripheral. Bounded by the connect timeout.
    async fn connect(&mut self, peripheral: &Peripheral) -> Result<Self::Link>;
}

/// An open connection to one peripheral.
#[async_trait::async_trait]
pub trait Link: Send + 'static {
    /// Enable the telemetry stream. Bounded by the connect timeout.
    async fn subscribe(&mut self) -> Result<()>;

    /// Wait for the next inbound event.
    ///
    /// Must be cancel-safe: the supervisor drops this future whenever its
    /// poll tick or the stop signal fires first.
    async fn next_frame(&mut self) -> Result<Inbound>;

    /// Whether the link is still up.
    async fn is_connected(&mut self) -> bool;

    /// Close the link. Errors are logged by the caller, never retried.
    async fn disconnect(&mut self) -> Result<()>;
}
