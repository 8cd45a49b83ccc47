use serde::{Deserialize, Serialize};

/// Sync client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// WebSocket base URL of the relay.
    pub relay_url: String,
    /// Peer id announced in every envelope. Generated when unset.
    pub client_id: Option<String>,
    pub auto_reconnect: bool,
    /// Valid range: 0-100.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Deadline for transport open + handshake ACK, in milliseconds.
    pub connection_timeout_ms: u64,
    /// How long `request_active_role` waits for an answer, in milliseconds.
    pub role_transfer_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8787".into(),
            client_id: None,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 2000,
            connection_timeout_ms: 10_000,
            role_transfer_timeout_ms: 10_000,
        }
    }
}
