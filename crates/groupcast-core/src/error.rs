use thiserror::Error;

/// Errors raised by a [`SharedBackend`](crate::SharedBackend) implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached (pool exhausted, connection refused).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but rejected or failed the command.
    #[error("backend command failed: {0}")]
    Command(String),

    /// A subscription stream ended.
    #[error("subscription closed: {0}")]
    Closed(String),
}

impl BackendError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn closed(channel: impl Into<String>) -> Self {
        Self::Closed(channel.into())
    }

    /// True when the failure is about reaching the backend at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackendError::unavailable("connection refused");
        assert_eq!(err.to_string(), "backend unavailable: connection refused");
        assert!(err.is_unavailable());

        let err = BackendError::command("WRONGTYPE");
        assert_eq!(err.to_string(), "backend command failed: WRONGTYPE");
        assert!(!err.is_unavailable());

        let err = BackendError::closed("room_broadcast");
        assert_eq!(err.to_string(), "subscription closed: room_broadcast");
    }
}
