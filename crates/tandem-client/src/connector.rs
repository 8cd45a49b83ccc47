//! How a client opens its transport to the relay.

use async_trait::async_trait;
use tandem_common::SyncError;
use tandem_protocol::transport::websocket;
use tandem_protocol::Transport;
use tokio_tungstenite::connect_async;

/// Opens a transport to `session_id` on the relay at `relay_url`.
///
/// The host application picks the implementation when it builds the client.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, relay_url: &str, session_id: &str) -> Result<Transport, SyncError>;
}

/// Connects over WebSocket to `{relay_url}/sessions/{session_id}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, relay_url: &str, session_id: &str) -> Result<Transport, SyncError> {
        let url = session_url(relay_url, session_id);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::ConnectionFailed(format!("{url}: {e}")))?;
        Ok(websocket(ws))
    }
}

pub fn session_url(relay_url: &str, session_id: &str) -> String {
    format!("{}/sessions/{}", relay_url.trim_end_matches('/'), session_id)
}
