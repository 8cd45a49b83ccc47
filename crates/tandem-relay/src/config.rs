//! Runtime settings for the session manager.

use std::time::Duration;

use tandem_config::RelaySettings;
use tandem_protocol::{ConflictPolicy, PROTOCOL_VERSION};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// TTL for sessions created without `expires_in`.
    pub default_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    /// Empty sessions idle longer than this are swept.
    pub empty_session_grace: Duration,
    /// Off means legacy forwarding: every frame goes verbatim to the peer.
    pub role_management: bool,
    pub default_policy: ConflictPolicy,
    /// `None` leaves a forwarded decision open until the requester gives up.
    pub transfer_decision_timeout: Option<Duration>,
    /// Version a handshake must announce.
    pub protocol_version: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

impl From<&RelaySettings> for ManagerConfig {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            default_ttl: Duration::from_secs(settings.session_ttl_secs),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
            empty_session_grace: Duration::from_secs(settings.empty_session_grace_secs),
            role_management: settings.role_management,
            default_policy: settings.conflict_policy,
            transfer_decision_timeout: match settings.transfer_decision_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            protocol_version: PROTOCOL_VERSION,
        }
    }
}
