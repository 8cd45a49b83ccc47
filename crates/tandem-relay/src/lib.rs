//! tandem relay: pairs two peers per session and coordinates which one
//! drives.
//!
//! [`SessionManager`] is the entry point. An upgrade layer (the bundled
//! [`connection::handle_connection`], or an embedder's own) hands it inbound
//! transports via [`SessionManager::admit`]; from there the manager owns the
//! connection until it closes or is evicted.

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
mod routing;
pub mod session;

pub use config::ManagerConfig;
pub use error::RelayError;
pub use manager::{Maintenance, SessionManager};
pub use session::{ConnectionInfo, CreateSessionOptions, SessionInfo, MAX_SESSION_TTL};
