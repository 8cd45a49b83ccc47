//! Runtime settings for [`RelayClient`](crate::RelayClient).

use std::time::Duration;

use tandem_common::new_client_id;
use tandem_config::ClientSettings;
use tandem_protocol::PROTOCOL_VERSION;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stamped on every envelope this client sends.
    pub client_id: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Deadline for opening the transport and receiving PROTOCOL_ACK.
    pub connection_timeout: Duration,
    /// How long `request_active_role` waits for a decision.
    pub role_transfer_timeout: Duration,
    /// Version announced in the handshake.
    pub protocol_version: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ClientConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            client_id: settings.client_id.clone().unwrap_or_else(new_client_id),
            auto_reconnect: settings.auto_reconnect,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            role_transfer_timeout: Duration::from_millis(settings.role_transfer_timeout_ms),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}
