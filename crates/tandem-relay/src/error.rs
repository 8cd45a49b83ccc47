#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("session not found")]
    SessionNotFound,

    #[error("session full")]
    SessionFull,

    #[error("session {0} already exists")]
    SessionExists(String),

    #[error("session closed")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_read_naturally() {
        assert_eq!(RelayError::SessionNotFound.to_string(), "session not found");
        assert_eq!(RelayError::SessionFull.to_string(), "session full");
        assert_eq!(
            RelayError::SessionExists("abc".into()).to_string(),
            "session abc already exists"
        );
    }
}
