//! The message envelope: `{type, clientId, data?, timestamp, protocolVersion}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_common::{now_millis, SyncError};

use crate::types::PROTOCOL_VERSION;

/// Every kind of frame exchanged between clients and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ProtocolHandshake,
    ProtocolAck,
    ClientConnected,
    ClientDisconnected,
    StateUpdate,
    RequestSync,
    RequestControl,
    OfferControl,
    AcceptControl,
    DeclineControl,
    ReleaseControl,
    ConfirmTransfer,
    RoleChanged,
    Error,
}

impl MessageType {
    /// Kinds only the relay may originate.
    pub fn is_relay_only(self) -> bool {
        matches!(
            self,
            MessageType::ProtocolAck | MessageType::ClientConnected | MessageType::ClientDisconnected
        )
    }
}

/// One unit of wire exchange. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: u64,
    pub protocol_version: u32,
}

impl Envelope {
    pub fn new(kind: MessageType, client_id: impl Into<String>) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            data: None,
            timestamp: now_millis(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Build an envelope carrying a typed payload.
    pub fn with_data<T: Serialize>(
        kind: MessageType,
        client_id: impl Into<String>,
        data: &T,
    ) -> Result<Self, SyncError> {
        let value = serde_json::to_value(data)
            .map_err(|e| SyncError::InvalidMessage(format!("failed to encode {kind:?}: {e}")))?;
        let mut envelope = Self::new(kind, client_id);
        envelope.data = Some(value);
        Ok(envelope)
    }

    /// Build an envelope carrying an opaque JSON value as-is.
    pub fn with_value(kind: MessageType, client_id: impl Into<String>, data: serde_json::Value) -> Self {
        let mut envelope = Self::new(kind, client_id);
        envelope.data = Some(data);
        envelope
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn parse(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::InvalidMessage(format!("malformed envelope: {e}")))
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self)
            .map_err(|e| SyncError::InvalidMessage(format!("failed to encode envelope: {e}")))
    }

    /// Decode `data` into a typed payload. A missing `data` field decodes
    /// from `null`, so payload types with all-optional fields still work.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        let value = self.data.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| {
            SyncError::InvalidMessage(format!("invalid {:?} payload: {e}", self.kind))
        })
    }
}
