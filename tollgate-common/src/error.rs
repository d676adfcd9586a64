//! Standardized error types for all Tollgate components

use crate::types::ViolationClass;
use thiserror::Error;

/// Standard result type used throughout Tollgate
pub type TollResult<T> = std::result::Result<T, TollError>;

/// Terminal rejection codes produced by the ingest verifier.
///
/// Each code maps to one HTTP status in the RPC layer and, where
/// attributable to the reader, to one violation class for the trust
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    UnknownReader,
    BadKeyVersion,
    BadSignature,
    Replay,
    StaleTimestamp,
    RateLimited,
    ReaderSuspended,
}

impl RejectCode {
    /// Stable wire identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::UnknownReader => "UNKNOWN_READER",
            RejectCode::BadKeyVersion => "BAD_KEY_VERSION",
            RejectCode::BadSignature => "BAD_SIGNATURE",
            RejectCode::Replay => "REPLAY",
            RejectCode::StaleTimestamp => "STALE_TIMESTAMP",
            RejectCode::RateLimited => "RATE_LIMITED",
            RejectCode::ReaderSuspended => "READER_SUSPENDED",
        }
    }

    /// Violation class reported to the trust engine, if the rejection is
    /// attributable to the submitting reader.
    pub fn violation(&self) -> Option<ViolationClass> {
        match self {
            RejectCode::UnknownReader => None,
            RejectCode::BadKeyVersion => Some(ViolationClass::BadKeyVersion),
            RejectCode::BadSignature => Some(ViolationClass::BadSignature),
            RejectCode::Replay => Some(ViolationClass::Replay),
            RejectCode::StaleTimestamp => Some(ViolationClass::StaleTimestamp),
            RejectCode::RateLimited => Some(ViolationClass::RateExceeded),
            RejectCode::ReaderSuspended => None,
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive error type for all Tollgate operations
#[derive(Error, Debug)]
pub enum TollError {
    /// Ingest verification terminated with a rejection code
    #[error("ingest rejected: {code}")]
    Rejected {
        /// Terminal rejection code
        code: RejectCode,
        /// Human-readable detail for the caller
        detail: String,
    },

    // Authentication of admin calls
    #[error("unauthorized")]
    Unauthorized,

    // Validation errors (malformed input)
    #[error("Validation error: {0}")]
    Validation(String),

    // Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration / policy errors
    #[error("Config error: {0}")]
    Config(String),

    // Chain integrity errors
    #[error("Chain error: {0}")]
    Chain(String),

    // Anchor submission errors that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    // Fatal conditions; the node refuses to serve ingest
    #[error("Fatal error: {0}")]
    Fatal(String),

    // State management errors
    #[error("State error: {0}")]
    State(String),

    // Request exceeded its deadline
    #[error("Deadline exceeded: {0}")]
    Deadline(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    // External library errors
    #[error("External error: {0}")]
    External(#[from] anyhow::Error),
}

impl TollError {
    /// Create a rejection with a detail message
    pub fn rejected(code: RejectCode, detail: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            detail: detail.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new chain integrity error
    pub fn chain(msg: impl Into<String>) -> Self {
        Self::Chain(msg.into())
    }

    /// Create a new transient infrastructure error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a new fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create a new state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a new deadline error
    pub fn deadline(msg: impl Into<String>) -> Self {
        Self::Deadline(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new database error from a message
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Internal(format!("Database: {}", msg.into()))
    }

    /// Whether this error should never be retried (auth/validation class).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TollError::Rejected { .. }
                | TollError::Unauthorized
                | TollError::Validation(_)
                | TollError::Fatal(_)
        )
    }

    /// Whether this error is a transient infrastructure failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, TollError::Transient(_) | TollError::Deadline(_))
    }
}

/// Convenience macro for creating TollError instances
#[macro_export]
macro_rules! toll_error {
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::TollError::$variant(format!($($arg)*))
    };
}

/// Convenience macro for returning early with a TollError
#[macro_export]
macro_rules! toll_bail {
    ($variant:ident, $($arg:tt)*) => {
        return Err($crate::toll_error!($variant, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_code_violations() {
        assert_eq!(
            RejectCode::Replay.violation(),
            Some(ViolationClass::Replay)
        );
        assert_eq!(
            RejectCode::BadSignature.violation(),
            Some(ViolationClass::BadSignature)
        );
        assert_eq!(RejectCode::UnknownReader.violation(), None);
        assert_eq!(RejectCode::ReaderSuspended.violation(), None);
    }

    #[test]
    fn test_error_classes() {
        assert!(TollError::rejected(RejectCode::Replay, "dup").is_terminal());
        assert!(TollError::Unauthorized.is_terminal());
        assert!(TollError::transient("ledger down").is_transient());
        assert!(!TollError::transient("ledger down").is_terminal());
    }

    #[test]
    fn test_macros() {
        let err = toll_error!(Validation, "bad field {}", "nonce");
        assert!(matches!(err, TollError::Validation(_)));
    }
}
