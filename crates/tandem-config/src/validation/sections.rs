//! Validation for the relay and client sections.

use crate::schema::TandemConfig;

use super::helpers::validate_range;

/// Validate relay constraints.
pub(crate) fn validate_relay(errors: &mut Vec<String>, config: &TandemConfig) {
    let relay = &config.relay;
    if relay.port == 0 {
        errors.push("relay.port must not be 0".into());
    }
    if relay.bind.trim().is_empty() {
        errors.push("relay.bind must not be empty".into());
    }
    validate_range(errors, "relay.session_ttl_secs", relay.session_ttl_secs, 1, 86_400);
    validate_range(
        errors,
        "relay.heartbeat_interval_secs",
        relay.heartbeat_interval_secs,
        1,
        3600,
    );
    validate_range(
        errors,
        "relay.cleanup_interval_secs",
        relay.cleanup_interval_secs,
        1,
        3600,
    );
    validate_range(
        errors,
        "relay.transfer_decision_timeout_secs",
        relay.transfer_decision_timeout_secs,
        0,
        600,
    );
}

/// Validate client constraints.
pub(crate) fn validate_client(errors: &mut Vec<String>, config: &TandemConfig) {
    let client = &config.client;
    if !(client.relay_url.starts_with("ws://") || client.relay_url.starts_with("wss://")) {
        errors.push(format!(
            "client.relay_url = {} must be a ws:// or wss:// URL",
            client.relay_url
        ));
    }
    validate_range(
        errors,
        "client.max_reconnect_attempts",
        u64::from(client.max_reconnect_attempts),
        0,
        100,
    );
    validate_range(
        errors,
        "client.connection_timeout_ms",
        client.connection_timeout_ms,
        100,
        120_000,
    );
    validate_range(
        errors,
        "client.role_transfer_timeout_ms",
        client.role_transfer_timeout_ms,
        100,
        120_000,
    );
    if matches!(client.client_id.as_deref(), Some(id) if id.trim().is_empty()) {
        errors.push("client.client_id must not be blank".into());
    }
}
