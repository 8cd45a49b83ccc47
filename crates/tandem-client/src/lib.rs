//! tandem sync client.
//!
//! A [`RelayClient`] joins one relay session, negotiates the protocol
//! version, and tracks this peer's role (`passive`, `requesting`, `active`).
//! Only the active peer may publish tutorial state; control moves between
//! peers through request/offer/accept/decline/release exchanges. Changes are
//! published on one event stream per concern.

pub mod client;
pub mod config;
pub mod connector;
mod handler;
mod handshake;
mod reconnect;
pub mod types;

pub use client::RelayClient;
pub use config::ClientConfig;
pub use connector::{session_url, Connector, WebSocketConnector};
pub use types::{
    ConnectionStatus, ControlEvent, ControlOffer, ControlRequest, PeerEvent, RoleChange,
    StateUpdate,
};
