//! Connection state machine states

use std::fmt;

/// Where the supervisor is in its connection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link; either idle between attempts or stopped
    #[default]
    Disconnected,
    /// Looking for the peripheral
    Discovering,
    /// Opening the link
    Connecting,
    /// Link open and telemetry stream subscribed
    Subscribed,
    /// Frames are flowing
    Streaming,
    /// The last attempt failed; a backoff or exit follows
    Error,
}

impl ConnectionState {
    /// Whether a link is currently open.
    pub fn is_linked(self) -> bool {
        matches!(self, ConnectionState::Subscribed | ConnectionState::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}
