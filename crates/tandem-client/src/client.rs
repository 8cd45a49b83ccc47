//! Public handle for one peer's connection to a relay session.

use std::sync::Arc;

use serde::Serialize;
use tandem_common::{now_millis, EventBus, SessionId, SyncError};
use tandem_protocol::{
    reasons, ControlDecision, ControlRelease, Envelope, MessageType, Role, RoleChangedData,
    RoleTransferRequest, StateTransferPackage, TransportSender,
};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connector::{Connector, WebSocketConnector};
use crate::types::{ConnectionStatus, ControlEvent, PeerEvent, RoleChange, StateUpdate};

const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Relay and session the client is (or was last) attached to.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) relay_url: String,
    pub(crate) session_id: SessionId,
}

/// A control offer or request from the peer awaiting our answer.
pub(crate) enum Incoming {
    Offer(StateTransferPackage),
    Request(RoleTransferRequest),
}

/// An ACCEPT_CONTROL we sent; roles switch once the relay confirms it.
pub(crate) struct PendingAccept {
    pub(crate) accepting: Accepting,
    pub(crate) reply: oneshot::Sender<bool>,
}

pub(crate) enum Accepting {
    /// Becomes active with the offered state.
    Offer(StateTransferPackage),
    /// Steps down to passive.
    Request,
}

#[derive(Default)]
pub(crate) struct ClientState {
    pub(crate) status: ConnectionStatus,
    pub(crate) role: Role,
    pub(crate) outbound: Option<TransportSender>,
    pub(crate) target: Option<Target>,
    pub(crate) connection_id: Option<String>,
    pub(crate) auto_reconnect: bool,
    pub(crate) reconnect_attempts: u32,
    /// Resolves an outstanding `request_active_role`.
    pub(crate) pending_request: Option<oneshot::Sender<bool>>,
    pub(crate) incoming: Option<Incoming>,
    pub(crate) pending_accept: Option<PendingAccept>,
    pub(crate) last_state: Option<serde_json::Value>,
    /// Bumped per established transport; stale reader tasks compare it.
    pub(crate) generation: u64,
    pub(crate) reader: Option<JoinHandle<()>>,
    pub(crate) reconnect: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) state: Mutex<ClientState>,
    pub(crate) status_bus: EventBus<ConnectionStatus>,
    pub(crate) role_bus: EventBus<RoleChange>,
    pub(crate) state_bus: EventBus<StateUpdate>,
    pub(crate) control_bus: EventBus<ControlEvent>,
    pub(crate) peer_bus: EventBus<PeerEvent>,
    pub(crate) error_bus: EventBus<SyncError>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One peer of a tutorial sync session.
///
/// Cheap to clone; clones share the same connection and state. Background
/// tasks (reader, reconnect) hold clones too, so call
/// [`disconnect`](Self::disconnect) to stop them.
#[derive(Clone)]
pub struct RelayClient {
    pub(crate) shared: Arc<Shared>,
}

impl RelayClient {
    /// Client that connects over WebSocket.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                state: Mutex::new(ClientState::default()),
                status_bus: EventBus::new(EVENT_CAPACITY),
                role_bus: EventBus::new(EVENT_CAPACITY),
                state_bus: EventBus::new(EVENT_CAPACITY),
                control_bus: EventBus::new(EVENT_CAPACITY),
                peer_bus: EventBus::new(EVENT_CAPACITY),
                error_bus: EventBus::new(EVENT_CAPACITY),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    // -- event streams ------------------------------------------------------

    pub fn status_events(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.shared.status_bus.subscribe()
    }

    pub fn role_events(&self) -> broadcast::Receiver<RoleChange> {
        self.shared.role_bus.subscribe()
    }

    pub fn state_events(&self) -> broadcast::Receiver<StateUpdate> {
        self.shared.state_bus.subscribe()
    }

    pub fn control_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.shared.control_bus.subscribe()
    }

    pub fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.peer_bus.subscribe()
    }

    pub fn error_events(&self) -> broadcast::Receiver<SyncError> {
        self.shared.error_bus.subscribe()
    }

    // -- queries ------------------------------------------------------------

    pub async fn is_connected(&self) -> bool {
        self.shared.state.lock().await.status == ConnectionStatus::Connected
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().await.status
    }

    pub async fn current_role(&self) -> Role {
        self.shared.state.lock().await.role
    }

    /// Last tutorial state sent or received.
    pub async fn last_state(&self) -> Option<serde_json::Value> {
        self.shared.state.lock().await.last_state.clone()
    }

    /// Id the relay assigned to the current connection.
    pub async fn connection_id(&self) -> Option<String> {
        self.shared.state.lock().await.connection_id.clone()
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Join `session_id` on the relay at `relay_url`.
    ///
    /// Resolves once the relay acknowledges the handshake. Failure is both
    /// returned and published on [`error_events`](Self::error_events); a
    /// failed first attempt does not start the reconnect policy.
    pub async fn connect(
        &self,
        relay_url: &str,
        session_id: impl Into<SessionId>,
    ) -> Result<(), SyncError> {
        {
            let mut st = self.shared.state.lock().await;
            if st.status != ConnectionStatus::Disconnected {
                return Err(SyncError::InvalidOperation(
                    "client is already connected or connecting".into(),
                ));
            }
            st.target = Some(Target {
                relay_url: relay_url.to_string(),
                session_id: session_id.into(),
            });
            st.auto_reconnect = self.shared.config.auto_reconnect;
            st.reconnect_attempts = 0;
            self.set_status(&mut st, ConnectionStatus::Connecting);
        }

        if let Err(e) = self.establish().await {
            let mut st = self.shared.state.lock().await;
            if st.status == ConnectionStatus::Connecting {
                self.set_status(&mut st, ConnectionStatus::Disconnected);
            }
            drop(st);
            self.emit_error(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        let mut st = self.shared.state.lock().await;
        st.auto_reconnect = false;
        st.generation += 1;
        if let Some(task) = st.reconnect.take() {
            task.abort();
        }
        if let Some(task) = st.reader.take() {
            task.abort();
        }
        if let Some(outbound) = st.outbound.take() {
            outbound.close(Some("client disconnect"));
        }
        st.connection_id = None;
        self.reset_session_state(&mut st);
        self.set_status(&mut st, ConnectionStatus::Disconnected);
        info!(client = %self.client_id(), "Disconnected");
    }

    // -----------------------------------------------------------------------
    // Role transfer API
    // -----------------------------------------------------------------------

    /// Ask for the active role.
    ///
    /// Resolves `true` once granted (immediately if already active) and
    /// `false` on decline or when no decision arrives in time.
    pub async fn request_active_role(&self, reason: Option<String>) -> Result<bool, SyncError> {
        let decision = {
            let mut st = self.shared.state.lock().await;
            match st.role {
                Role::Active => return Ok(true),
                Role::Requesting => {
                    return Err(SyncError::InvalidOperation(
                        "a control request is already pending".into(),
                    ))
                }
                Role::Passive => {}
            }
            let request = RoleTransferRequest::new(self.client_id(), reason);
            self.send_data(&st, MessageType::RequestControl, &request)?;

            let (tx, rx) = oneshot::channel();
            st.pending_request = Some(tx);
            self.transition(&mut st, Role::Requesting);
            rx
        };

        match tokio::time::timeout(self.shared.config.role_transfer_timeout, decision).await {
            Ok(Ok(granted)) => Ok(granted),
            // The connection dropped and took the request with it.
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                let mut st = self.shared.state.lock().await;
                st.pending_request = None;
                if st.role == Role::Requesting {
                    self.transition(&mut st, Role::Passive);
                }
                drop(st);
                warn!(client = %self.client_id(), "Control request timed out");
                self.emit_error(SyncError::Timeout("no answer to control request".into()));
                Ok(false)
            }
        }
    }

    /// Offer the active role, with the last known state, to the peer. Our
    /// role only changes once the peer accepts.
    pub async fn offer_control_to_other(&self) -> Result<(), SyncError> {
        let st = self.shared.state.lock().await;
        if st.role != Role::Active {
            return Err(SyncError::InvalidOperation(
                "only the active client can offer control".into(),
            ));
        }
        let package = StateTransferPackage::new(st.last_state.clone(), self.client_id());
        self.send_data(&st, MessageType::OfferControl, &package)
    }

    /// Give up the active role. A no-op while not active.
    pub async fn release_active_role(&self) -> Result<(), SyncError> {
        let mut st = self.shared.state.lock().await;
        if st.role != Role::Active {
            return Ok(());
        }
        let release = ControlRelease {
            reason: None,
            timestamp: now_millis(),
        };
        let sent = self.send_data(&st, MessageType::ReleaseControl, &release);
        self.transition(&mut st, Role::Passive);
        sent
    }

    /// Answer the pending offer or request with ACCEPT_CONTROL.
    ///
    /// Roles switch only when the relay confirms the handover: accepting an
    /// offer then adopts its state and makes us active, accepting a request
    /// hands our last state over and makes us passive. Resolves `true` once
    /// confirmed and `false` if the transfer lapsed first (the relay's
    /// decision deadline, the peer leaving, or no confirmation in time).
    pub async fn accept_control(&self) -> Result<bool, SyncError> {
        let confirmed = {
            let mut st = self.shared.state.lock().await;
            if st.pending_accept.is_some() {
                return Err(SyncError::InvalidOperation(
                    "an acceptance is already awaiting confirmation".into(),
                ));
            }
            let accepting = match st.incoming.take() {
                None => {
                    return Err(SyncError::InvalidOperation(
                        "no control offer or request to accept".into(),
                    ))
                }
                Some(Incoming::Offer(package)) => {
                    self.send_data(&st, MessageType::AcceptControl, &ControlDecision::granted())?;
                    Accepting::Offer(package)
                }
                Some(Incoming::Request(request)) => {
                    if st.role != Role::Active {
                        return Err(SyncError::InvalidOperation(
                            "control request arrived while not active".into(),
                        ));
                    }
                    let mut package =
                        StateTransferPackage::new(st.last_state.clone(), self.client_id());
                    package.to_client_id = Some(request.requester_id);
                    let decision = ControlDecision::granted().with_transfer(package);
                    self.send_data(&st, MessageType::AcceptControl, &decision)?;
                    Accepting::Request
                }
            };
            let (reply, rx) = oneshot::channel();
            st.pending_accept = Some(PendingAccept { accepting, reply });
            rx
        };

        match tokio::time::timeout(self.shared.config.role_transfer_timeout, confirmed).await {
            Ok(Ok(confirmed)) => Ok(confirmed),
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                self.shared.state.lock().await.pending_accept = None;
                warn!(client = %self.client_id(), "Acceptance was never confirmed");
                self.emit_error(SyncError::Timeout("no confirmation of control handover".into()));
                Ok(false)
            }
        }
    }

    /// Answer the pending offer or request with DECLINE_CONTROL.
    pub async fn decline_control(&self) -> Result<(), SyncError> {
        let mut st = self.shared.state.lock().await;
        if st.incoming.take().is_none() {
            return Err(SyncError::InvalidOperation(
                "no control offer or request to decline".into(),
            ));
        }
        let decision = ControlDecision::declined(reasons::DECLINED);
        self.send_data(&st, MessageType::DeclineControl, &decision)
    }

    // -----------------------------------------------------------------------
    // State sync
    // -----------------------------------------------------------------------

    /// Publish tutorial state to the peer. Only the active client may.
    pub async fn send_tutorial_state(&self, state: serde_json::Value) -> Result<(), SyncError> {
        let mut st = self.shared.state.lock().await;
        if st.role != Role::Active {
            return Err(SyncError::InvalidOperation(
                "only the active client can send tutorial state".into(),
            ));
        }
        let envelope = Envelope::with_value(MessageType::StateUpdate, self.client_id(), state.clone())
            .with_protocol_version(self.shared.config.protocol_version);
        self.send(&st, &envelope)?;
        st.last_state = Some(state);
        Ok(())
    }

    /// Ask the peer to resend its state if it is active.
    pub async fn request_sync(&self) -> Result<(), SyncError> {
        let st = self.shared.state.lock().await;
        self.send(&st, &self.envelope(MessageType::RequestSync))
    }

    // -----------------------------------------------------------------------
    // Internals shared with the handler and connection tasks
    // -----------------------------------------------------------------------

    pub(crate) fn envelope(&self, kind: MessageType) -> Envelope {
        Envelope::new(kind, self.client_id()).with_protocol_version(self.shared.config.protocol_version)
    }

    pub(crate) fn send(&self, st: &ClientState, envelope: &Envelope) -> Result<(), SyncError> {
        let outbound = st
            .outbound
            .as_ref()
            .ok_or_else(|| SyncError::ConnectionFailed("not connected".into()))?;
        outbound
            .send_text(envelope.to_json()?)
            .map_err(|e| SyncError::ConnectionFailed(e.to_string()))
    }

    pub(crate) fn send_data<T: Serialize>(
        &self,
        st: &ClientState,
        kind: MessageType,
        data: &T,
    ) -> Result<(), SyncError> {
        let envelope = Envelope::with_data(kind, self.client_id(), data)?
            .with_protocol_version(self.shared.config.protocol_version);
        self.send(st, &envelope)
    }

    pub(crate) fn set_status(&self, st: &mut ClientState, status: ConnectionStatus) {
        if st.status != status {
            st.status = status;
            self.shared.status_bus.publish(status);
        }
    }

    /// Change the local role, publish it, and tell the peer when the
    /// active/passive distinction flips. `Requesting` is never announced.
    pub(crate) fn transition(&self, st: &mut ClientState, role: Role) {
        let previous = st.role;
        if previous == role {
            return;
        }
        st.role = role;
        debug!(client = %self.client_id(), ?previous, current = ?role, "Role changed");
        self.shared.role_bus.publish(RoleChange {
            previous,
            current: role,
        });

        if role != Role::Requesting && previous.is_active() != role.is_active() {
            let announce = RoleChangedData {
                role,
                timestamp: now_millis(),
            };
            if let Err(e) = self.send_data(st, MessageType::RoleChanged, &announce) {
                debug!(error = %e, "Could not announce role change");
            }
        }
    }

    /// Take over the state carried with a control handover.
    pub(crate) fn adopt_transfer(&self, st: &mut ClientState, package: StateTransferPackage) {
        if !package.checksum_matches() {
            warn!(from = %package.from_client_id, checksum = %package.checksum, "Transfer checksum mismatch");
        }
        if let Some(state) = package.state {
            st.last_state = Some(state.clone());
            self.shared.state_bus.publish(StateUpdate {
                state,
                from: package.from_client_id,
            });
        }
    }

    /// Apply the relay's CONFIRM_TRANSFER to our outstanding acceptance.
    pub(crate) fn complete_acceptance(&self, st: &mut ClientState) -> bool {
        let Some(pending) = st.pending_accept.take() else {
            return false;
        };
        match pending.accepting {
            Accepting::Offer(package) => {
                self.adopt_transfer(st, package);
                self.transition(st, Role::Active);
                info!(client = %self.client_id(), "Accepted offer confirmed");
            }
            Accepting::Request => {
                self.transition(st, Role::Passive);
                info!(client = %self.client_id(), "Handover to requester confirmed");
            }
        }
        let _ = pending.reply.send(true);
        true
    }

    /// Resolve an outstanding acceptance as lapsed. Roles stay as they are.
    pub(crate) fn abandon_acceptance(&self, st: &mut ClientState) -> bool {
        match st.pending_accept.take() {
            Some(pending) => {
                let _ = pending.reply.send(false);
                true
            }
            None => false,
        }
    }

    /// Forget everything tied to the session's current connection. The
    /// relay drops our role with the connection, so we do too.
    pub(crate) fn reset_session_state(&self, st: &mut ClientState) {
        if let Some(pending) = st.pending_request.take() {
            let _ = pending.send(false);
        }
        self.abandon_acceptance(st);
        st.incoming = None;
        if st.role != Role::Passive {
            let previous = st.role;
            st.role = Role::Passive;
            self.shared.role_bus.publish(RoleChange {
                previous,
                current: Role::Passive,
            });
        }
    }

    pub(crate) fn emit_error(&self, error: SyncError) {
        self.shared.error_bus.publish(error);
    }
}
