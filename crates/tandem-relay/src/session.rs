//! Session and connection state.
//!
//! A `Session` pairs at most two connections and tracks which one holds the
//! active role. All mutation happens through `&mut Session` while the
//! manager holds that session's lock, and every write to a peer is a
//! non-blocking `try_send`, so a handling step never yields half-way through
//! (e.g. between flipping a connection's role and `active_connection_id`).

use std::time::{Duration, Instant};

use serde::Serialize;
use tandem_common::now_millis;
use tandem_protocol::{
    reasons, ConflictPolicy, ConnectionNotice, ControlDecision, Envelope, ErrorData, MessageType,
    Role, TransportSender, MAX_CONNECTIONS_PER_SESSION, RELAY_SENDER_ID,
};
use tracing::{debug, info, warn};

/// Longest lifetime a session can be given; longer requests are clamped.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Options & snapshots
// ---------------------------------------------------------------------------

/// Input to `SessionManager::create_session`.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Caller-supplied id; generated when `None`.
    pub session_id: Option<String>,
    /// Lifetime; the manager's default TTL when `None`.
    pub expires_in: Option<Duration>,
    pub conflict_policy: Option<ConflictPolicy>,
    pub metadata: Option<serde_json::Value>,
}

/// Administrative snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_activity: u64,
    pub client_count: usize,
    pub metadata: serde_json::Value,
    pub active_connection_id: Option<String>,
    pub role_transfer_in_progress: bool,
    pub conflict_policy: ConflictPolicy,
    pub connections: Vec<ConnectionInfo>,
}

impl SessionInfo {
    pub fn connection(&self, connection_id: &str) -> Option<&ConnectionInfo> {
        self.connections
            .iter()
            .find(|c| c.connection_id == connection_id)
    }
}

/// Snapshot of one admitted connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub client_id: Option<String>,
    pub role: Role,
    pub connected_at: u64,
    pub last_role_change: u64,
    /// Last ping or pong seen from the peer, epoch millis.
    pub last_heartbeat: u64,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One admitted peer. Owns the write half of its transport.
pub(crate) struct Connection {
    pub(crate) id: String,
    pub(crate) sender: TransportSender,
    /// Declared by the peer in its handshake.
    pub(crate) client_id: Option<String>,
    pub(crate) connected_at: u64,
    /// Admission order across the manager; breaks `connected_at` ties.
    pub(crate) admitted_seq: u64,
    pub(crate) last_heartbeat: u64,
    pub(crate) role: Role,
    pub(crate) last_role_change: u64,
    pub(crate) handshake_complete: bool,
}

impl Connection {
    pub(crate) fn new(id: String, sender: TransportSender, admitted_seq: u64) -> Self {
        let now = now_millis();
        Self {
            id,
            sender,
            client_id: None,
            connected_at: now,
            admitted_seq,
            last_heartbeat: now,
            role: Role::Passive,
            last_role_change: now,
            handshake_complete: false,
        }
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        if self.role != role {
            self.role = role;
            self.last_role_change = now_millis();
        }
    }

    /// Write a raw frame. Failures are logged; the heartbeat evicts
    /// connections whose transport has gone away.
    pub(crate) fn send_raw(&self, text: &str) {
        if let Err(e) = self.sender.send_text(text) {
            warn!(connection = %self.id, error = %e, "Dropping frame for connection");
        }
    }

    pub(crate) fn send(&self, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(json) => self.send_raw(&json),
            Err(e) => warn!(connection = %self.id, error = %e, "Failed to encode envelope"),
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id.clone(),
            client_id: self.client_id.clone(),
            role: self.role,
            connected_at: self.connected_at,
            last_role_change: self.last_role_change,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

// ---------------------------------------------------------------------------
// Pending role transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferKind {
    /// A passive peer asked for control; the incumbent decides.
    Request,
    /// The active peer offered control; the passive peer decides.
    Offer,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingTransfer {
    pub(crate) id: u64,
    pub(crate) kind: TransferKind,
    pub(crate) initiator: String,
    /// The connection whose ACCEPT/DECLINE settles the transfer.
    pub(crate) responder: String,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    pub(crate) id: String,
    pub(crate) created_at: u64,
    pub(crate) expires_at: u64,
    pub(crate) expires: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) last_activity_ms: u64,
    pub(crate) connections: Vec<Connection>,
    pub(crate) active_connection_id: Option<String>,
    pub(crate) transfer: Option<PendingTransfer>,
    pub(crate) policy: ConflictPolicy,
    pub(crate) metadata: serde_json::Value,
    pub(crate) role_management: bool,
    pub(crate) protocol_version: u32,
    next_transfer_id: u64,
    /// Set once the session is deleted or swept; late admissions bounce.
    pub(crate) closed: bool,
}

impl Session {
    pub(crate) fn new(
        id: String,
        ttl: Duration,
        policy: ConflictPolicy,
        metadata: serde_json::Value,
        role_management: bool,
        protocol_version: u32,
    ) -> Self {
        let ttl = ttl.min(MAX_SESSION_TTL);
        let now = Instant::now();
        let now_ms = now_millis();
        Self {
            id,
            created_at: now_ms,
            expires_at: now_ms + ttl.as_millis() as u64,
            expires: now + ttl,
            last_activity: now,
            last_activity_ms: now_ms,
            connections: Vec::with_capacity(MAX_CONNECTIONS_PER_SESSION),
            active_connection_id: None,
            transfer: None,
            policy,
            metadata,
            role_management,
            protocol_version,
            next_transfer_id: 1,
            closed: false,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_activity: self.last_activity_ms,
            client_count: self.connections.len(),
            metadata: self.metadata.clone(),
            active_connection_id: self.active_connection_id.clone(),
            role_transfer_in_progress: self.transfer.is_some(),
            conflict_policy: self.policy,
            connections: self.connections.iter().map(Connection::info).collect(),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.connections.len() >= MAX_CONNECTIONS_PER_SESSION
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }

    /// Empty and untouched for longer than `grace`.
    pub(crate) fn is_abandoned(&self, now: Instant, grace: Duration) -> bool {
        self.connections.is_empty() && now.duration_since(self.last_activity) >= grace
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_ms = now_millis();
    }

    pub(crate) fn next_transfer_id(&mut self) -> u64 {
        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        id
    }

    // -- lookup -------------------------------------------------------------

    pub(crate) fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub(crate) fn connection_mut(&mut self, id: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    /// The other connection in the session, if any.
    pub(crate) fn peer_of(&self, id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id != id)
    }

    // -- sending ------------------------------------------------------------

    pub(crate) fn send_to(&self, to: &str, envelope: &Envelope) {
        match self.connection(to) {
            Some(conn) => conn.send(envelope),
            None => debug!(session = %self.id, connection = %to, "Send target is gone"),
        }
    }

    pub(crate) fn forward_raw(&self, to: &str, raw: &str) {
        if let Some(conn) = self.connection(to) {
            conn.send_raw(raw);
        }
    }

    /// Verbatim fan-out to every connection except the sender.
    pub(crate) fn broadcast_raw(&self, from: &str, raw: &str) {
        for conn in self.connections.iter().filter(|c| c.id != from) {
            conn.send_raw(raw);
        }
    }

    pub(crate) fn send_relay_message<T: Serialize>(&self, to: &str, kind: MessageType, data: &T) {
        match Envelope::with_data(kind, RELAY_SENDER_ID, data) {
            Ok(envelope) => self.send_to(to, &envelope),
            Err(e) => warn!(session = %self.id, error = %e, "Failed to build relay message"),
        }
    }

    pub(crate) fn send_error(&self, to: &str, message: impl Into<String>) {
        self.send_relay_message(
            to,
            MessageType::Error,
            &ErrorData {
                message: message.into(),
            },
        );
    }

    pub(crate) fn send_decline(&self, to: &str, reason: &str) {
        self.send_relay_message(
            to,
            MessageType::DeclineControl,
            &ControlDecision::declined(reason),
        );
    }

    // -- membership ---------------------------------------------------------

    fn notice_for(&self, conn: &Connection) -> ConnectionNotice {
        ConnectionNotice {
            connection_id: conn.id.clone(),
            client_id: conn.client_id.clone(),
            role: conn.role,
            client_count: self.connections.len(),
            active_connection_id: self.active_connection_id.clone(),
        }
    }

    /// Register a connection and announce it: CLIENT_CONNECTED to the
    /// newcomer (its own id) and to the existing peer (the newcomer's id).
    /// Callers check `is_full` first.
    pub(crate) fn add_connection(&mut self, conn: Connection) {
        let id = conn.id.clone();
        self.connections.push(conn);
        self.touch();

        let Some(conn) = self.connection(&id) else {
            return;
        };
        let notice = self.notice_for(conn);
        for target in &self.connections {
            match Envelope::with_data(MessageType::ClientConnected, RELAY_SENDER_ID, &notice) {
                Ok(envelope) => target.send(&envelope),
                Err(e) => warn!(session = %self.id, error = %e, "Failed to build notice"),
            }
        }

        info!(
            session = %self.id,
            connection = %id,
            clients = self.connections.len(),
            "Connection admitted"
        );
    }

    /// Remove a connection, close its transport, and tell the remaining
    /// peer. Clears `active_connection_id` and any transfer it was part of.
    pub(crate) fn remove_connection(&mut self, id: &str, reason: Option<&str>) -> Option<Connection> {
        let index = self.connections.iter().position(|c| c.id == id)?;
        let conn = self.connections.remove(index);
        conn.sender.close(reason);
        self.touch();

        if self.active_connection_id.as_deref() == Some(id) {
            self.active_connection_id = None;
        }

        if let Some(transfer) = self.transfer.take() {
            if transfer.responder == id {
                self.send_decline(&transfer.initiator, reasons::PEER_DISCONNECTED);
            } else if transfer.initiator != id {
                self.transfer = Some(transfer);
            }
        }

        let notice = ConnectionNotice {
            connection_id: conn.id.clone(),
            client_id: conn.client_id.clone(),
            role: conn.role,
            client_count: self.connections.len(),
            active_connection_id: self.active_connection_id.clone(),
        };
        for peer in &self.connections {
            match Envelope::with_data(MessageType::ClientDisconnected, RELAY_SENDER_ID, &notice) {
                Ok(envelope) => peer.send(&envelope),
                Err(e) => warn!(session = %self.id, error = %e, "Failed to build notice"),
            }
        }

        info!(
            session = %self.id,
            connection = %id,
            last_role = %conn.role,
            reason = reason.unwrap_or("closed"),
            "Connection removed"
        );
        Some(conn)
    }

    /// Close every transport and mark the session dead.
    pub(crate) fn close_all(&mut self, reason: &str) {
        self.closed = true;
        self.active_connection_id = None;
        self.transfer = None;
        for conn in self.connections.drain(..) {
            conn.sender.close(Some(reason));
        }
    }

    // -- liveness -----------------------------------------------------------

    pub(crate) fn record_heartbeat(&mut self, id: &str) {
        if let Some(conn) = self.connection_mut(id) {
            conn.last_heartbeat = now_millis();
        }
    }

    /// Ping every open connection. Returns the ids whose transport is no
    /// longer open; the caller evicts them.
    pub(crate) fn heartbeat(&self) -> Vec<String> {
        let mut stale = Vec::new();
        for conn in &self.connections {
            if !conn.sender.is_open() || conn.sender.ping().is_err() {
                stale.push(conn.id.clone());
            }
        }
        stale
    }
}
