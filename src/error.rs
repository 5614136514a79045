//! Typed error conditions callers need to tell apart
//!
//! Everything else travels as `anyhow::Error`; these variants are attached to
//! (or returned as) an `anyhow::Error` and recovered with `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// The cross-process writer gate could not be acquired within its retry budget
    #[error("writer gate busy; another process is updating the cache")]
    WriterBusy,

    /// A required argument was missing or malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `initialize` has not completed successfully
    #[error("policy cache is not initialized")]
    NotInitialized,
}

impl CacheError {
    /// True if `err` (or anything in its context chain) is a `CacheError::Cancelled`
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<CacheError>(), Some(CacheError::Cancelled)))
    }

    /// True if `err` is caller misuse that must not be swallowed
    pub fn is_invalid_argument(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<CacheError>(), Some(CacheError::InvalidArgument(_))))
    }
}
