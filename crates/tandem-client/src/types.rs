//! Event payloads published by [`RelayClient`].

use std::fmt;

use tandem_common::SyncError;
use tandem_protocol::{Role, RoleTransferRequest, StateTransferPackage};

use crate::client::RelayClient;

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to make reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
}

// ---------------------------------------------------------------------------
// Role & state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleChange {
    pub previous: Role,
    pub current: Role,
}

/// Tutorial state received from the peer, or adopted with control.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub state: serde_json::Value,
    /// `clientId` of the peer that produced it.
    pub from: String,
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// The active peer offers control to us.
    Offered(ControlOffer),
    /// The passive peer asks us for control.
    Requested(ControlRequest),
    /// Our request or offer was turned down.
    Declined { reason: Option<String> },
    /// The offer or request we were asked to answer lapsed before our
    /// answer took effect.
    Withdrawn { reason: Option<String> },
    /// The peer gave up the active role.
    Released,
    /// The relay confirmed the handover we accepted.
    Confirmed,
}

/// A pending OFFER_CONTROL. Answer with [`accept`](Self::accept) or
/// [`decline`](Self::decline).
#[derive(Clone)]
pub struct ControlOffer {
    pub(crate) client: RelayClient,
    pub package: StateTransferPackage,
}

impl ControlOffer {
    /// Take control and adopt the offered state. `true` once the relay
    /// confirms; `false` if the offer lapsed first.
    pub async fn accept(&self) -> Result<bool, SyncError> {
        self.client.accept_control().await
    }

    pub async fn decline(&self) -> Result<(), SyncError> {
        self.client.decline_control().await
    }
}

impl fmt::Debug for ControlOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlOffer")
            .field("package", &self.package)
            .finish()
    }
}

/// A forwarded REQUEST_CONTROL awaiting our decision.
#[derive(Clone)]
pub struct ControlRequest {
    pub(crate) client: RelayClient,
    pub request: RoleTransferRequest,
}

impl ControlRequest {
    /// Hand control (and the last state) to the requester. `true` once the
    /// relay confirms; `false` if the request lapsed first.
    pub async fn accept(&self) -> Result<bool, SyncError> {
        self.client.accept_control().await
    }

    pub async fn decline(&self) -> Result<(), SyncError> {
        self.client.decline_control().await
    }
}

impl fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlRequest")
            .field("request", &self.request)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Joined {
        connection_id: String,
        client_id: Option<String>,
    },
    Left {
        connection_id: String,
        last_role: Role,
    },
    RoleChanged { role: Role },
}
