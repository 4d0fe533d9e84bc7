use thiserror::Error;

/// Classification of a fetch failure, used by the retry policy.
///
/// Transient failures (network hiccups, timeouts, 5xx-style upstream
/// errors) are retried; permanent failures (validation, 4xx-style
/// rejections) are surfaced immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    Permanent,
}

#[derive(Error, Debug)]
pub enum FasqError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("fetch error ({kind:?}): {message}")]
    Fetch {
        kind: FetchErrorKind,
        message: String,
    },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("secure storage error: {0}")]
    SecureStorage(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("key rotation failed for {} row(s)", .failed_keys.len())]
    Rotation { failed_keys: Vec<String> },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("worker error: {0}")]
    Worker(String),
}

impl FasqError {
    /// Build a transient fetch error.
    pub fn transient(message: impl Into<String>) -> Self {
        FasqError::Fetch {
            kind: FetchErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Build a permanent fetch error.
    pub fn permanent(message: impl Into<String>) -> Self {
        FasqError::Fetch {
            kind: FetchErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Default transient/permanent classification.
    ///
    /// Conservative: only errors explicitly marked transient and timeouts
    /// are retried. Applications plug in their own classifier through
    /// `RetryPolicy` when they can be smarter.
    pub fn default_classification(&self) -> FetchErrorKind {
        match self {
            FasqError::Fetch { kind, .. } => *kind,
            FasqError::Timeout(_) => FetchErrorKind::Transient,
            _ => FetchErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.default_classification() == FetchErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, FasqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_classification() {
        assert!(FasqError::transient("connection reset").is_transient());
        assert!(!FasqError::permanent("404 not found").is_transient());
        assert!(FasqError::Timeout("fetch".to_string()).is_transient());
        assert!(!FasqError::Validation("bad key".to_string()).is_transient());
    }

    #[test]
    fn test_rotation_error_message() {
        let err = FasqError::Rotation {
            failed_keys: vec!["a:1".to_string(), "a:2".to_string()],
        };
        assert!(err.to_string().contains("2 row(s)"));
    }
}
