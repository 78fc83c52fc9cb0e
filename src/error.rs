//! Error types for the cerrojo client library.

/// Error type for store (KV and session endpoint) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned error: status={code}, message={message}")]
    Status { code: u16, message: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Error type for session manager operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session no longer exists on the server. Terminal for the
    /// session; dependents must treat it as loss of ownership.
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session creation failed: {0}")]
    Create(#[source] StoreError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Error type for lock and semaphore operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Acquire called while this instance already holds the resource.
    #[error("lock already held by this instance")]
    Held,

    /// Release called while this instance does not hold the resource.
    #[error("lock not held by this instance")]
    NotHeld,

    /// Destroy called while a live holder owns the resource.
    #[error("lock in use by a live holder")]
    InUse,

    /// The key is owned by the other coordination protocol
    /// (lock vs. semaphore marker mismatch).
    #[error("key is managed by a conflicting coordination protocol")]
    Conflict,

    /// An operation required a session that no longer exists.
    #[error("session expired or no longer exists")]
    SessionExpired,

    /// A bounded wait elapsed without success. Not fatal; the caller
    /// decides whether to retry.
    #[error("wait budget elapsed before the resource was acquired")]
    Timeout,

    /// The caller's cancellation signal fired during a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// The lock was lost while a guarded action was still running and
    /// the action was abandoned.
    #[error("lock lost while the guarded action was running")]
    Aborted,

    /// The instance was destroyed; its state machine is terminal.
    #[error("instance already destroyed")]
    Destroyed,

    /// The supplied options are unusable.
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Error propagated from a user-supplied guarded action.
    #[error("{0}")]
    Action(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LockError::Held;
        assert_eq!(err.to_string(), "lock already held by this instance");

        let err = LockError::NotHeld;
        assert_eq!(err.to_string(), "lock not held by this instance");

        let err = StoreError::Status {
            code: 500,
            message: "internal error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "server returned error: status=500, message=internal error"
        );
    }

    #[test]
    fn test_session_not_found_propagates() {
        let err: LockError = SessionError::NotFound("abc".to_string()).into();
        assert_eq!(err.to_string(), "session not found: abc");
        assert!(matches!(err, LockError::Session(SessionError::NotFound(_))));
    }
}
