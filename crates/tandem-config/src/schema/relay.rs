use serde::{Deserialize, Serialize};
use tandem_protocol::ConflictPolicy;

/// Relay server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Interface to bind.
    pub bind: String,
    pub port: u16,
    /// Default session lifetime in seconds (valid range: 1-86400).
    pub session_ttl_secs: u64,
    /// Ping interval for live connections (valid range: 1-3600).
    pub heartbeat_interval_secs: u64,
    /// Interval between expiry sweeps (valid range: 1-3600).
    pub cleanup_interval_secs: u64,
    /// How long an empty session survives without activity.
    pub empty_session_grace_secs: u64,
    /// Route by role (gate STATE_UPDATE, coordinate transfers). Off means
    /// every frame is forwarded verbatim.
    pub role_management: bool,
    /// Policy for new sessions.
    pub conflict_policy: ConflictPolicy,
    /// Auto-decline a forwarded control decision after this many seconds.
    /// 0 waits forever.
    pub transfer_decision_timeout_secs: u64,
    /// Create unknown sessions on connect instead of rejecting.
    pub auto_create_sessions: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8787,
            session_ttl_secs: 30 * 60,
            heartbeat_interval_secs: 30,
            cleanup_interval_secs: 60,
            empty_session_grace_secs: 60,
            role_management: true,
            conflict_policy: ConflictPolicy::FirstComeFirstServed,
            transfer_decision_timeout_secs: 10,
            auto_create_sessions: false,
        }
    }
}
