//! Inbound frame handling: the receiving half of the role state machine.

use tandem_common::{now_millis, SyncError};
use tandem_protocol::{
    reasons, ConnectionNotice, ControlDecision, ControlRelease, Envelope, ErrorData, MessageType,
    Role, RoleChangedData, RoleTransferRequest, StateTransferPackage, TransferConfirmation,
    RELAY_SENDER_ID,
};
use tracing::{debug, info, warn};

use crate::client::{Accepting, ClientState, Incoming, RelayClient};
use crate::types::{ControlEvent, ControlOffer, ControlRequest, PeerEvent, StateUpdate};

impl RelayClient {
    /// Apply one inbound text frame.
    pub(crate) async fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed frame from relay");
                self.emit_error(e);
                return;
            }
        };

        let kind = envelope.kind;
        let mut st = self.shared.state.lock().await;
        let handled = match kind {
            MessageType::AcceptControl => self.on_accept(&mut st, &envelope),
            MessageType::DeclineControl => self.on_decline(&mut st, &envelope),
            MessageType::OfferControl => self.on_offer(&mut st, &envelope),
            MessageType::RequestControl => self.on_request(&mut st, &envelope),
            MessageType::ReleaseControl => self.on_release(&mut st, &envelope),
            MessageType::ConfirmTransfer => {
                self.on_confirm(&mut st, &envelope);
                Ok(())
            }
            MessageType::StateUpdate => {
                self.on_state_update(&mut st, envelope);
                Ok(())
            }
            MessageType::RequestSync => self.on_request_sync(&st),
            MessageType::RoleChanged => envelope.payload::<RoleChangedData>().map(|data| {
                self.shared
                    .peer_bus
                    .publish(PeerEvent::RoleChanged { role: data.role });
            }),
            MessageType::ClientConnected => envelope.payload::<ConnectionNotice>().map(|notice| {
                if st.connection_id.as_deref() != Some(notice.connection_id.as_str()) {
                    self.shared.peer_bus.publish(PeerEvent::Joined {
                        connection_id: notice.connection_id,
                        client_id: notice.client_id,
                    });
                }
            }),
            MessageType::ClientDisconnected => {
                envelope.payload::<ConnectionNotice>().map(|notice| {
                    // Whatever the peer offered or asked for left with it.
                    st.incoming = None;
                    self.abandon_acceptance(&mut st);
                    self.shared.peer_bus.publish(PeerEvent::Left {
                        connection_id: notice.connection_id,
                        last_role: notice.role,
                    });
                })
            }
            MessageType::Error => envelope.payload::<ErrorData>().map(|error| {
                warn!(message = %error.message, "Relay reported an error");
                self.emit_error(SyncError::ServerError(error.message));
            }),
            MessageType::ProtocolHandshake | MessageType::ProtocolAck => {
                debug!(?kind, "Ignoring handshake frame after connect");
                Ok(())
            }
        };

        if let Err(e) = handled {
            drop(st);
            warn!(?kind, error = %e, "Failed to handle frame");
            self.emit_error(e);
        }
    }

    // -- control ------------------------------------------------------------

    fn on_accept(&self, st: &mut ClientState, envelope: &Envelope) -> Result<(), SyncError> {
        let decision: ControlDecision = envelope.payload()?;
        match st.role {
            Role::Requesting => {
                if let Some(package) = decision.transfer {
                    self.adopt_transfer(st, package);
                }
                self.transition(st, Role::Active);
                if let Some(pending) = st.pending_request.take() {
                    let _ = pending.send(true);
                }
                info!(client = %self.client_id(), "Active role granted");
            }
            Role::Active => {
                // The peer took the offer, or the relay handed control over.
                st.incoming = None;
                self.transition(st, Role::Passive);
                let confirmation = TransferConfirmation {
                    active_connection_id: None,
                    timestamp: now_millis(),
                };
                self.send_data(st, MessageType::ConfirmTransfer, &confirmation)?;
                info!(client = %self.client_id(), "Active role handed over");
            }
            Role::Passive if decision.granted => {
                // A grant for a request we already gave up on. Hand it back so
                // the relay does not keep us marked active.
                let release = ControlRelease {
                    reason: Some("request abandoned".into()),
                    timestamp: now_millis(),
                };
                self.send_data(st, MessageType::ReleaseControl, &release)?;
                debug!(client = %self.client_id(), "Released late grant");
            }
            Role::Passive => {}
        }
        Ok(())
    }

    fn on_decline(&self, st: &mut ClientState, envelope: &Envelope) -> Result<(), SyncError> {
        let decision: ControlDecision = envelope
            .payload()
            .unwrap_or_else(|_| ControlDecision::declined(reasons::DECLINED));
        if st.role == Role::Requesting {
            self.transition(st, Role::Passive);
            if let Some(pending) = st.pending_request.take() {
                let _ = pending.send(false);
            }
        } else {
            // The relay voids a decision we were asked for, answered or not.
            let prompted = st.incoming.take().is_some();
            if self.abandon_acceptance(st) || prompted {
                debug!(client = %self.client_id(), reason = ?decision.reason, "Control prompt withdrawn");
                self.shared.control_bus.publish(ControlEvent::Withdrawn {
                    reason: decision.reason,
                });
                return Ok(());
            }
        }
        debug!(client = %self.client_id(), reason = ?decision.reason, "Control declined");
        self.shared.control_bus.publish(ControlEvent::Declined {
            reason: decision.reason,
        });
        Ok(())
    }

    fn on_confirm(&self, st: &mut ClientState, envelope: &Envelope) {
        let active = envelope
            .payload::<TransferConfirmation>()
            .ok()
            .and_then(|c| c.active_connection_id);
        if envelope.client_id != RELAY_SENDER_ID {
            debug!(from = %envelope.client_id, "Peer confirmed handover");
            return;
        }
        if self.complete_acceptance(st) {
            debug!(active = ?active, "Transfer confirmed");
            self.shared.control_bus.publish(ControlEvent::Confirmed);
        } else {
            debug!(active = ?active, "Confirmation without a pending acceptance");
        }
    }

    fn on_offer(&self, st: &mut ClientState, envelope: &Envelope) -> Result<(), SyncError> {
        if st.role == Role::Active {
            warn!(client = %self.client_id(), "Offer received while already active");
            return Ok(());
        }
        let package: StateTransferPackage = envelope.payload()?;
        st.incoming = Some(Incoming::Offer(package.clone()));
        self.shared
            .control_bus
            .publish(ControlEvent::Offered(ControlOffer {
                client: self.clone(),
                package,
            }));
        Ok(())
    }

    fn on_request(&self, st: &mut ClientState, envelope: &Envelope) -> Result<(), SyncError> {
        if st.role != Role::Active {
            debug!(client = %self.client_id(), "Control request received while not active");
            return Ok(());
        }
        let request: RoleTransferRequest = envelope.payload()?;
        st.incoming = Some(Incoming::Request(request.clone()));
        self.shared
            .control_bus
            .publish(ControlEvent::Requested(ControlRequest {
                client: self.clone(),
                request,
            }));
        Ok(())
    }

    fn on_release(&self, st: &mut ClientState, _envelope: &Envelope) -> Result<(), SyncError> {
        // The relay drops an offer along with the role that backed it.
        if matches!(st.incoming, Some(Incoming::Offer(_))) {
            st.incoming = None;
        }
        if matches!(
            st.pending_accept.as_ref().map(|p| &p.accepting),
            Some(Accepting::Offer(_))
        ) {
            self.abandon_acceptance(st);
        }
        if st.role == Role::Requesting {
            // The role is free now; ask again rather than wait out a decision
            // that will never come.
            let request = RoleTransferRequest::new(self.client_id(), None);
            self.send_data(st, MessageType::RequestControl, &request)?;
        }
        self.shared.control_bus.publish(ControlEvent::Released);
        Ok(())
    }

    // -- state --------------------------------------------------------------

    fn on_state_update(&self, st: &mut ClientState, envelope: Envelope) {
        let Some(state) = envelope.data else {
            debug!("STATE_UPDATE without data");
            return;
        };
        st.last_state = Some(state.clone());
        self.shared.state_bus.publish(StateUpdate {
            state,
            from: envelope.client_id,
        });
    }

    fn on_request_sync(&self, st: &ClientState) -> Result<(), SyncError> {
        if st.role != Role::Active {
            return Ok(());
        }
        let Some(state) = st.last_state.clone() else {
            return Ok(());
        };
        let envelope = Envelope::with_value(MessageType::StateUpdate, self.client_id(), state)
            .with_protocol_version(self.shared.config.protocol_version);
        self.send(st, &envelope)
    }
}
