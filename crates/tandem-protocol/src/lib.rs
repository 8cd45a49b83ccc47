//! Wire vocabulary shared by the relay and its clients.
//!
//! Every frame on the wire is one JSON [`Envelope`]. The relay forwards most
//! envelopes verbatim; only the handshake and the role-coordination kinds are
//! interpreted. State payloads (`STATE_UPDATE`) are opaque JSON and never
//! inspected.

pub mod message;
pub mod payload;
pub mod transport;
pub mod types;

pub use message::{Envelope, MessageType};
pub use payload::{
    reasons, state_checksum, ConnectionNotice, ControlDecision, ControlRelease, ErrorData,
    HandshakeData, ProtocolAck, RoleChangedData, RoleTransferRequest, StateTransferPackage,
    TransferConfirmation,
};
pub use transport::{Outbound, Transport, TransportError, TransportEvent, TransportSender};
pub use types::{
    ConflictPolicy, Role, MAX_CONNECTIONS_PER_SESSION, PROTOCOL_VERSION, RELAY_SENDER_ID,
};
