//! Opening a transport and negotiating the protocol version.

use tandem_common::{now_millis, SyncError};
use tandem_protocol::{
    ConnectionNotice, Envelope, ErrorData, HandshakeData, MessageType, ProtocolAck,
    TransportEvent, TransportSender,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::RelayClient;
use crate::types::{ConnectionStatus, PeerEvent};

impl RelayClient {
    /// Open the transport to the current target and complete the handshake
    /// within the connection timeout. On success the client is `Connected`
    /// and a reader task owns the inbound side.
    pub(crate) async fn establish(&self) -> Result<(), SyncError> {
        let target = self
            .shared
            .state
            .lock()
            .await
            .target
            .clone()
            .ok_or_else(|| SyncError::InvalidOperation("no session to connect to".into()))?;

        let timeout = self.shared.config.connection_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || SyncError::Timeout(format!("no PROTOCOL_ACK within {timeout:?}"));

        let transport = tokio::time::timeout_at(
            deadline,
            self.shared
                .connector
                .connect(&target.relay_url, target.session_id.as_str()),
        )
        .await
        .map_err(|_| timed_out())??;
        let (sender, mut events) = transport.into_parts();

        let connection_id =
            match tokio::time::timeout_at(deadline, self.handshake(&sender, &mut events)).await {
                Ok(Ok(connection_id)) => connection_id,
                Ok(Err(e)) => {
                    sender.close(None);
                    return Err(e);
                }
                Err(_) => {
                    warn!(client = %self.client_id(), ?timeout, "Handshake timed out");
                    sender.close(Some("handshake timeout"));
                    return Err(timed_out());
                }
            };

        let mut st = self.shared.state.lock().await;
        // `disconnect` ran while we were connecting.
        if matches!(st.status, ConnectionStatus::Disconnected | ConnectionStatus::Connected) {
            sender.close(Some("client disconnect"));
            return Err(SyncError::ConnectionFailed(
                "connection abandoned while connecting".into(),
            ));
        }

        st.generation += 1;
        st.outbound = Some(sender.clone());
        st.connection_id = connection_id;
        st.reconnect_attempts = 0;
        st.reader = Some(tokio::spawn(self.read_loop(sender, events, st.generation)));
        self.set_status(&mut st, ConnectionStatus::Connected);

        info!(
            client = %self.client_id(),
            session = %target.session_id,
            connection = ?st.connection_id,
            "Connected to relay"
        );
        Ok(())
    }

    /// Exchange PROTOCOL_HANDSHAKE / PROTOCOL_ACK. Yields the connection id
    /// the relay announced for us, if any.
    async fn handshake(
        &self,
        sender: &TransportSender,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> Result<Option<String>, SyncError> {
        let config = &self.shared.config;

        let hello = HandshakeData {
            version: config.protocol_version,
            timestamp: now_millis(),
        };
        let hello = Envelope::with_data(MessageType::ProtocolHandshake, self.client_id(), &hello)?
            .with_protocol_version(config.protocol_version);
        sender
            .send_text(hello.to_json()?)
            .map_err(|e| SyncError::ConnectionFailed(e.to_string()))?;

        let mut connection_id = None;
        loop {
            let text = match events.recv().await {
                Some(TransportEvent::Message(text)) => text,
                Some(TransportEvent::Ping) => {
                    let _ = sender.pong();
                    continue;
                }
                Some(TransportEvent::Pong) => continue,
                Some(TransportEvent::Closed(reason)) => {
                    return Err(SyncError::ConnectionFailed(
                        reason.unwrap_or_else(|| "closed during handshake".into()),
                    ))
                }
                Some(TransportEvent::Error(e)) => return Err(SyncError::ConnectionFailed(e)),
                None => {
                    return Err(SyncError::ConnectionFailed(
                        "transport closed during handshake".into(),
                    ))
                }
            };

            let envelope = match Envelope::parse(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed frame during handshake");
                    continue;
                }
            };

            match envelope.kind {
                MessageType::ClientConnected => {
                    let notice: ConnectionNotice = envelope.payload()?;
                    // The first notice names our own connection.
                    if connection_id.is_none() {
                        connection_id = Some(notice.connection_id);
                    } else {
                        self.shared.peer_bus.publish(PeerEvent::Joined {
                            connection_id: notice.connection_id,
                            client_id: notice.client_id,
                        });
                    }
                }
                MessageType::ProtocolAck => {
                    let ack: ProtocolAck = envelope.payload()?;
                    if !ack.accepted || ack.protocol_version != config.protocol_version {
                        warn!(
                            expected = config.protocol_version,
                            actual = ack.protocol_version,
                            error = ?ack.error,
                            "Relay rejected handshake"
                        );
                        sender.close(Some("protocol version mismatch"));
                        return Err(SyncError::ProtocolVersionMismatch {
                            expected: config.protocol_version,
                            actual: ack.protocol_version,
                        });
                    }
                    return Ok(connection_id);
                }
                MessageType::Error => {
                    let error: ErrorData = envelope.payload()?;
                    sender.close(None);
                    return Err(SyncError::ServerError(error.message));
                }
                other => debug!(kind = ?other, "Frame before PROTOCOL_ACK ignored"),
            }
        }
    }
}
