//! Protocol constants and the small enums that appear on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version announced in every handshake. Peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// `clientId` the relay stamps on envelopes it originates.
pub const RELAY_SENDER_ID: &str = "relay";

/// Admission limit: a session pairs exactly two peers.
pub const MAX_CONNECTIONS_PER_SESSION: usize = 2;

/// Role of a peer in a session.
///
/// `Requesting` only exists on the client while a control request is
/// outstanding; the relay tracks `Active`/`Passive` per connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Passive,
    Requesting,
    Active,
}

impl Role {
    pub fn is_active(self) -> bool {
        self == Role::Active
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Passive => "passive",
            Role::Requesting => "requesting",
            Role::Active => "active",
        };
        f.write_str(s)
    }
}

/// How the relay settles a control request when another peer is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The earlier-admitted connection wins.
    #[default]
    FirstComeFirstServed,
    /// Never hand control over on request.
    DenyBoth,
    /// Forward the request to the incumbent and let its operator decide.
    UserChoice,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictPolicy::FirstComeFirstServed => "first-come-first-served",
            ConflictPolicy::DenyBoth => "deny-both",
            ConflictPolicy::UserChoice => "user-choice",
        };
        f.write_str(s)
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-come-first-served" => Ok(ConflictPolicy::FirstComeFirstServed),
            "deny-both" => Ok(ConflictPolicy::DenyBoth),
            "user-choice" => Ok(ConflictPolicy::UserChoice),
            other => Err(format!("unknown conflict policy '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::Active).unwrap(), "\"active\"");
        assert_eq!(
            serde_json::from_str::<Role>("\"passive\"").unwrap(),
            Role::Passive
        );
        assert_eq!(Role::Requesting.to_string(), "requesting");
    }

    #[test]
    fn role_defaults_to_passive() {
        assert_eq!(Role::default(), Role::Passive);
        assert!(!Role::default().is_active());
    }

    #[test]
    fn conflict_policy_wire_names_match_display() {
        for policy in [
            ConflictPolicy::FirstComeFirstServed,
            ConflictPolicy::DenyBoth,
            ConflictPolicy::UserChoice,
        ] {
            let json = serde_json::to_string(&policy).unwrap();
            assert_eq!(json, format!("\"{policy}\""));
            assert_eq!(policy.to_string().parse::<ConflictPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn conflict_policy_rejects_unknown_name() {
        let err = "coin-flip".parse::<ConflictPolicy>().unwrap_err();
        assert!(err.contains("coin-flip"));
    }
}
