mod client;
mod endpoint;
mod watchdog;

pub use client::{ConnectionInfo, DeviceStreamClient, DisconnectReason};
pub use endpoint::{normalize_address, DeviceType, StreamEndpoint};

use serde::{Deserialize, Serialize};

/// Connection lifecycle of the device stream client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a reconnect backoff during an active recording
    Reconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}
