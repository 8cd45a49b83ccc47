//! Configuration schema types.
//!
//! All structs use `serde(default)` so partial configs work correctly.

mod client;
mod logging;
mod relay;

pub use client::*;
pub use logging::*;
pub use relay::*;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub relay: RelaySettings,
    pub client: ClientSettings,
    pub logging: LoggingConfig,
}
