//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# tandem configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[relay]
# bind = "0.0.0.0"
# port = 8787
# session_ttl_secs = 1800                 # 1-86400
# heartbeat_interval_secs = 30            # 1-3600
# cleanup_interval_secs = 60              # 1-3600
# empty_session_grace_secs = 60
# role_management = true
# conflict_policy = "first-come-first-served"   # or "deny-both", "user-choice"
# transfer_decision_timeout_secs = 10     # 0 = wait for the incumbent forever
# auto_create_sessions = false

[client]
# relay_url = "ws://127.0.0.1:8787"
# client_id = "desktop"
# auto_reconnect = true
# max_reconnect_attempts = 5              # 0-100
# reconnect_delay_ms = 2000
# connection_timeout_ms = 10000
# role_transfer_timeout_ms = 10000

[logging]
# level = "info"                          # trace, debug, info, warn, error
"##
    .to_string()
}
