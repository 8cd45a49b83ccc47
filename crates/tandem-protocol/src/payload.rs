//! Typed `data` payloads for the control and housekeeping message kinds.

use serde::{Deserialize, Serialize};
use tandem_common::now_millis;

use crate::types::Role;

/// Decline and notice reasons the relay puts on the wire.
pub mod reasons {
    pub const TRANSFER_IN_PROGRESS: &str = "transfer_in_progress";
    pub const FIRST_COME_FIRST_SERVED: &str = "first_come_first_served";
    pub const DENIED_BY_POLICY: &str = "denied_by_policy";
    pub const NO_PEER: &str = "no_peer";
    pub const DECISION_TIMEOUT: &str = "decision_timeout";
    pub const PEER_DISCONNECTED: &str = "peer_disconnected";
    pub const DECLINED: &str = "declined";
}

/// `PROTOCOL_HANDSHAKE` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    pub version: u32,
    pub timestamp: u64,
}

/// `PROTOCOL_ACK` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolAck {
    pub accepted: bool,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `CLIENT_CONNECTED` / `CLIENT_DISCONNECTED` data.
///
/// On disconnect, `role` is the role the departed connection last held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionNotice {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub role: Role,
    pub client_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_connection_id: Option<String>,
}

/// `REQUEST_CONTROL` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleTransferRequest {
    pub requester_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RoleTransferRequest {
    pub fn new(requester_id: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            target_id: None,
            timestamp: now_millis(),
            reason,
        }
    }
}

/// Tutorial state handed over with control (`OFFER_CONTROL`, and inside an
/// `ACCEPT_CONTROL` answering a request).
///
/// `checksum` is a diagnostic hint derived from the serialized length and
/// the timestamp. It does not prove integrity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransferPackage {
    #[serde(default)]
    pub state: Option<serde_json::Value>,
    pub timestamp: u64,
    pub from_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_client_id: Option<String>,
    pub checksum: String,
}

impl StateTransferPackage {
    pub fn new(state: Option<serde_json::Value>, from_client_id: impl Into<String>) -> Self {
        let timestamp = now_millis();
        let checksum = state_checksum(state.as_ref(), timestamp);
        Self {
            state,
            timestamp,
            from_client_id: from_client_id.into(),
            to_client_id: None,
            checksum,
        }
    }

    /// Recompute the checksum; a mismatch is worth a log line, nothing more.
    pub fn checksum_matches(&self) -> bool {
        state_checksum(self.state.as_ref(), self.timestamp) == self.checksum
    }
}

/// `"{len:x}-{timestamp:x}"` of the serialized state.
pub fn state_checksum(state: Option<&serde_json::Value>, timestamp: u64) -> String {
    let len = state.map(|s| s.to_string().len()).unwrap_or(0);
    format!("{len:x}-{timestamp:x}")
}

/// `ACCEPT_CONTROL` / `DECLINE_CONTROL` data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlDecision {
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<StateTransferPackage>,
    pub timestamp: u64,
}

impl ControlDecision {
    pub fn granted() -> Self {
        Self {
            granted: true,
            reason: None,
            transfer: None,
            timestamp: now_millis(),
        }
    }

    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: Some(reason.into()),
            transfer: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_transfer(mut self, transfer: StateTransferPackage) -> Self {
        self.transfer = Some(transfer);
        self
    }
}

/// `RELEASE_CONTROL` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRelease {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: u64,
}

/// `CONFIRM_TRANSFER` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfirmation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_connection_id: Option<String>,
    pub timestamp: u64,
}

/// `ROLE_CHANGED` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChangedData {
    pub role: Role,
    pub timestamp: u64,
}

/// `ERROR` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}
