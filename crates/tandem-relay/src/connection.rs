//! WebSocket upgrade: pick the session out of the request path, then hand
//! the socket to the manager.

use std::net::SocketAddr;

use tandem_protocol::transport::websocket;
use tokio::net::TcpStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::manager::SessionManager;
use crate::session::CreateSessionOptions;

/// Handle one inbound TCP connection.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: SessionManager,
    auto_create: bool,
) {
    let mut path = String::new();
    let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = match accept_hdr_async(stream, capture_path).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
            return;
        }
    };

    let transport = websocket(ws);
    let Some(session_id) = session_id_from_path(&path) else {
        tracing::warn!(peer = %addr, path = %path, "No session id in upgrade path");
        transport.sender.close(Some("missing session id"));
        return;
    };

    if auto_create && manager.get_session(session_id).await.is_none() {
        let options = CreateSessionOptions {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        };
        // Losing a creation race to the other peer is fine.
        if let Err(e) = manager.create_session(options).await {
            tracing::debug!(session = %session_id, error = %e, "Auto-create skipped");
        }
    }

    match manager.admit(session_id, transport).await {
        Ok(connection_id) => {
            tracing::info!(peer = %addr, session = %session_id, connection = %connection_id, "Client attached");
        }
        Err(e) => {
            tracing::info!(peer = %addr, session = %session_id, error = %e, "Client refused");
        }
    }
}

/// `/sessions/{id}` or `/{id}`, ignoring a trailing slash.
pub fn session_id_from_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_matches('/');
    let id = trimmed.strip_prefix("sessions/").unwrap_or(trimmed);
    if id.is_empty() || id == "sessions" || id.contains('/') {
        return None;
    }
    Some(id)
}
