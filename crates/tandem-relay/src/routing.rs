//! Per-frame dispatch: handshake, role coordination, and forwarding.
//!
//! Everything here runs against `&mut Session` with the session lock held.
//! The caller acts on the returned [`Dispatch`] (evictions, decision
//! timers) after the frame has been fully applied.

use tandem_protocol::{
    reasons, ConflictPolicy, ControlDecision, Envelope, HandshakeData, MessageType, ProtocolAck,
    Role, TransferConfirmation, RELAY_SENDER_ID,
};
use tracing::{debug, info, warn};

use crate::session::{PendingTransfer, Session, TransferKind};

/// Follow-up work for the manager once the session lock is released.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Dispatch {
    /// A forwarded decision is now pending; arm its deadline.
    pub(crate) transfer_started: Option<u64>,
    /// Evict this connection with the given close reason.
    pub(crate) close: Option<(String, String)>,
}

impl Dispatch {
    fn close(connection_id: &str, reason: impl Into<String>) -> Self {
        Self {
            transfer_started: None,
            close: Some((connection_id.to_string(), reason.into())),
        }
    }

    fn transfer(id: u64) -> Self {
        Self {
            transfer_started: Some(id),
            close: None,
        }
    }
}

impl Session {
    /// Apply one inbound text frame from `from`.
    pub(crate) fn handle_frame(&mut self, from: &str, raw: &str) -> Dispatch {
        if self.connection(from).is_none() {
            return Dispatch::default();
        }
        self.touch();
        self.record_heartbeat(from);

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session = %self.id, connection = %from, error = %e, "Rejecting malformed frame");
                self.send_error(from, e.to_string());
                return Dispatch::default();
            }
        };

        if envelope.kind == MessageType::ProtocolHandshake {
            return self.handle_handshake(from, &envelope);
        }

        let handshaken = self
            .connection(from)
            .map(|c| c.handshake_complete)
            .unwrap_or(false);
        if !handshaken {
            debug!(session = %self.id, connection = %from, kind = ?envelope.kind, "Frame before handshake");
            self.send_error(from, "handshake required");
            return Dispatch::default();
        }

        if envelope.kind.is_relay_only() {
            self.send_error(from, format!("{:?} is reserved for the relay", envelope.kind));
            return Dispatch::default();
        }

        if !self.role_management {
            self.broadcast_raw(from, raw);
            return Dispatch::default();
        }

        match envelope.kind {
            MessageType::StateUpdate => {
                self.route_state_update(from, raw);
                Dispatch::default()
            }
            MessageType::RequestControl => self.handle_request_control(from, raw),
            MessageType::OfferControl => self.handle_offer_control(from, raw),
            MessageType::AcceptControl => {
                self.handle_accept_control(from, raw);
                Dispatch::default()
            }
            MessageType::DeclineControl => {
                self.handle_decline_control(from, raw);
                Dispatch::default()
            }
            MessageType::ReleaseControl => {
                self.handle_release_control(from, raw);
                Dispatch::default()
            }
            MessageType::Error => {
                let message = envelope
                    .data
                    .as_ref()
                    .and_then(|d| d.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("")
                    .to_string();
                warn!(session = %self.id, connection = %from, message = %message, "Client reported error");
                Dispatch::default()
            }
            // REQUEST_SYNC, CONFIRM_TRANSFER, ROLE_CHANGED
            _ => {
                self.broadcast_raw(from, raw);
                Dispatch::default()
            }
        }
    }

    // -- handshake ----------------------------------------------------------

    fn handle_handshake(&mut self, from: &str, envelope: &Envelope) -> Dispatch {
        let announced = envelope
            .payload::<HandshakeData>()
            .map(|h| h.version)
            .unwrap_or(envelope.protocol_version);
        let expected = self.protocol_version;

        if announced != expected {
            warn!(
                session = %self.id,
                connection = %from,
                expected,
                announced,
                "Protocol version mismatch"
            );
            let ack = ProtocolAck {
                accepted: false,
                protocol_version: expected,
                error: Some(format!(
                    "protocol version mismatch: relay speaks {expected}, client sent {announced}"
                )),
            };
            self.send_ack(from, &ack);
            return Dispatch::close(from, "protocol version mismatch");
        }

        if let Some(conn) = self.connection_mut(from) {
            conn.handshake_complete = true;
            if !envelope.client_id.is_empty() {
                conn.client_id = Some(envelope.client_id.clone());
            }
        }
        let ack = ProtocolAck {
            accepted: true,
            protocol_version: expected,
            error: None,
        };
        self.send_ack(from, &ack);
        debug!(session = %self.id, connection = %from, client = %envelope.client_id, "Handshake complete");
        Dispatch::default()
    }

    fn send_ack(&self, to: &str, ack: &ProtocolAck) {
        match Envelope::with_data(MessageType::ProtocolAck, RELAY_SENDER_ID, ack) {
            Ok(envelope) => self.send_to(to, &envelope.with_protocol_version(self.protocol_version)),
            Err(e) => warn!(session = %self.id, error = %e, "Failed to build ack"),
        }
    }

    // -- state --------------------------------------------------------------

    fn route_state_update(&self, from: &str, raw: &str) {
        if self.active_connection_id.as_deref() != Some(from) {
            debug!(session = %self.id, connection = %from, "Dropping STATE_UPDATE from non-active connection");
            return;
        }
        self.broadcast_raw(from, raw);
    }

    // -- role coordination --------------------------------------------------

    /// Make `id` the sole active connection; the other becomes passive.
    fn set_active(&mut self, id: &str) {
        for conn in &mut self.connections {
            conn.set_role(if conn.id == id {
                Role::Active
            } else {
                Role::Passive
            });
        }
        self.active_connection_id = Some(id.to_string());
    }

    fn send_granted(&self, to: &str) {
        self.send_relay_message(to, MessageType::AcceptControl, &ControlDecision::granted());
    }

    fn handle_request_control(&mut self, from: &str, raw: &str) -> Dispatch {
        let incumbent = match self.active_connection_id.clone() {
            None => {
                self.set_active(from);
                self.send_granted(from);
                info!(session = %self.id, connection = %from, "Active role granted");
                return Dispatch::default();
            }
            Some(id) if id == from => {
                self.send_granted(from);
                return Dispatch::default();
            }
            Some(id) => id,
        };

        if self.transfer.is_some() {
            self.send_decline(from, reasons::TRANSFER_IN_PROGRESS);
            return Dispatch::default();
        }

        match self.policy {
            ConflictPolicy::FirstComeFirstServed => {
                let seq_of = |id: &str| self.connection(id).map(|c| c.admitted_seq);
                let requester_first = match (seq_of(from), seq_of(&incumbent)) {
                    (Some(requester), Some(holder)) => requester < holder,
                    _ => false,
                };
                if requester_first {
                    self.set_active(from);
                    self.send_granted(from);
                    // The incumbent steps down on a grant while active.
                    self.send_granted(&incumbent);
                    info!(
                        session = %self.id,
                        connection = %from,
                        previous = %incumbent,
                        "Active role reclaimed by earlier connection"
                    );
                } else {
                    self.send_decline(from, reasons::FIRST_COME_FIRST_SERVED);
                }
                Dispatch::default()
            }
            ConflictPolicy::DenyBoth => {
                self.send_decline(from, reasons::DENIED_BY_POLICY);
                Dispatch::default()
            }
            ConflictPolicy::UserChoice => {
                let id = self.start_transfer(TransferKind::Request, from, &incumbent);
                self.forward_raw(&incumbent, raw);
                Dispatch::transfer(id)
            }
        }
    }

    fn handle_offer_control(&mut self, from: &str, raw: &str) -> Dispatch {
        if self.active_connection_id.as_deref() != Some(from) {
            self.send_error(from, "only the active connection can offer control");
            return Dispatch::default();
        }
        if self.transfer.is_some() {
            self.send_decline(from, reasons::TRANSFER_IN_PROGRESS);
            return Dispatch::default();
        }
        let Some(peer) = self.peer_of(from).map(|c| c.id.clone()) else {
            self.send_decline(from, reasons::NO_PEER);
            return Dispatch::default();
        };
        let id = self.start_transfer(TransferKind::Offer, from, &peer);
        self.forward_raw(&peer, raw);
        Dispatch::transfer(id)
    }

    fn start_transfer(&mut self, kind: TransferKind, initiator: &str, responder: &str) -> u64 {
        let id = self.next_transfer_id();
        self.transfer = Some(PendingTransfer {
            id,
            kind,
            initiator: initiator.to_string(),
            responder: responder.to_string(),
        });
        debug!(session = %self.id, transfer = id, ?kind, initiator, responder, "Role transfer pending");
        id
    }

    /// The pending transfer if `from` is the party asked to decide.
    fn transfer_awaiting(&self, from: &str) -> Option<PendingTransfer> {
        self.transfer
            .as_ref()
            .filter(|t| t.responder == from)
            .cloned()
    }

    fn handle_accept_control(&mut self, from: &str, raw: &str) {
        let Some(transfer) = self.transfer_awaiting(from) else {
            self.send_error(from, "no role transfer awaiting your decision");
            return;
        };
        self.transfer = None;

        let new_active = match transfer.kind {
            TransferKind::Request => transfer.initiator.clone(),
            TransferKind::Offer => transfer.responder.clone(),
        };
        self.set_active(&new_active);
        self.forward_raw(&transfer.initiator, raw);

        // The accepter switches roles only on this, so a late accept that
        // lost the race with the deadline never acts on its own.
        let confirmation = TransferConfirmation {
            active_connection_id: Some(new_active.clone()),
            timestamp: tandem_common::now_millis(),
        };
        self.send_relay_message(from, MessageType::ConfirmTransfer, &confirmation);

        info!(session = %self.id, active = %new_active, kind = ?transfer.kind, "Role transfer completed");
    }

    fn handle_decline_control(&mut self, from: &str, raw: &str) {
        let Some(transfer) = self.transfer_awaiting(from) else {
            self.send_error(from, "no role transfer awaiting your decision");
            return;
        };
        self.transfer = None;
        self.forward_raw(&transfer.initiator, raw);
        debug!(session = %self.id, transfer = transfer.id, "Role transfer declined");
    }

    fn handle_release_control(&mut self, from: &str, raw: &str) {
        if self.active_connection_id.as_deref() != Some(from) {
            self.send_error(from, "only the active connection can release control");
            return;
        }
        self.active_connection_id = None;
        if let Some(conn) = self.connection_mut(from) {
            conn.set_role(Role::Passive);
        }
        // A requester still waiting sees the RELEASE and can ask again.
        self.transfer = None;
        self.broadcast_raw(from, raw);
        info!(session = %self.id, connection = %from, "Active role released");
    }

    /// Auto-decline a forwarded decision that is still open. Stale ids are
    /// ignored.
    pub(crate) fn expire_transfer(&mut self, transfer_id: u64) -> bool {
        let Some(transfer) = self.transfer.as_ref().filter(|t| t.id == transfer_id).cloned() else {
            return false;
        };
        self.transfer = None;
        self.send_decline(&transfer.initiator, reasons::DECISION_TIMEOUT);
        self.send_decline(&transfer.responder, reasons::DECISION_TIMEOUT);
        info!(session = %self.id, transfer = transfer_id, "Role transfer decision timed out");
        true
    }
}
