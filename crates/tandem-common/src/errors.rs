use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Failures surfaced by the sync client and reported by the relay.
///
/// Cloneable so the same error can both reject a pending call and travel on
/// the client's error event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("maximum reconnect attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum TandemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
