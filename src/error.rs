//! # Error Handling for chaindex
//!
//! This module defines the error types used throughout chaindex. We use a single
//! error enum ([`Error`]) to represent all failure modes, which simplifies error
//! handling for library users.
//!
//! ## Error Categories
//!
//! | Category        | Examples                               | Typical Response            |
//! |-----------------|----------------------------------------|-----------------------------|
//! | Caller mistake  | Ill-formed cursor, bad base64          | Fail the request            |
//! | Store transient | Store locked, submission queue full    | Retry after backoff         |
//! | Worker fatal    | Worker died holding an in-flight job   | Retry; the pool respawns it |
//! | Internal        | SQLite error, schema version mismatch  | Log and investigate         |
//!
//! Two failure modes are deliberately NOT errors:
//!
//! - An open circuit breaker on the data-index reads surfaces as `Ok(None)` —
//!   "unknown", not "absent" (see [`crate::breaker`]).
//! - Invariant violations found by the debug checks are reported through
//!   [`crate::debug_info::DebugInfo`] `errors`, never thrown.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in chaindex operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller Mistakes (fail the request)
    // =========================================================================
    /// A pagination cursor could not be decoded.
    ///
    /// Cursors are opaque to callers; they must be round-tripped unmodified.
    /// Any cursor that does not decode to the expected tuple lands here.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// An id, hash, or tag literal was not valid URL-safe base64.
    #[error("invalid base64 value: {0}")]
    Encoding(String),

    // =========================================================================
    // Store Transient (retryable)
    // =========================================================================
    /// SQLite operation failed.
    ///
    /// Lock contention is retried inside the worker for up to the 30-second
    /// busy timeout before it surfaces here; anything else (disk full,
    /// corruption, SQL bug) comes through directly.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A pool's submission queue is at capacity.
    ///
    /// The job was never enqueued. Treat like a locked store: back off and
    /// retry.
    #[error("{pool} {role} queue is full")]
    QueueFull {
        /// Pool name (`core`, `bundles`, `data`, `moderation`, `gql`, `debug`).
        pool: &'static str,
        /// `read` or `write`.
        role: &'static str,
    },

    // =========================================================================
    // Worker Fatal
    // =========================================================================
    /// The worker processing this job exited before replying.
    ///
    /// The pool rebuilds the worker; the in-flight job is not re-run.
    #[error("{pool} {role} worker died while processing the job")]
    WorkerDied {
        pool: &'static str,
        role: &'static str,
    },

    // =========================================================================
    // Internal Errors (investigate and fix)
    // =========================================================================
    /// Schema version mismatch or store-setup failure.
    #[error("schema error: {0}")]
    Schema(String),

    /// A chunk fetch from the underlying chunk source failed.
    ///
    /// Destroys the transaction-data stream that requested it.
    #[error("chunk fetch failed: {0}")]
    ChunkFetch(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs; keep them readable and informative.
    #[test]
    fn test_error_display() {
        let cursor = Error::InvalidCursor("not a json tuple".to_string());
        assert_eq!(cursor.to_string(), "invalid cursor: not a json tuple");

        let full = Error::QueueFull {
            pool: "core",
            role: "write",
        };
        assert_eq!(full.to_string(), "core write queue is full");

        let died = Error::WorkerDied {
            pool: "gql",
            role: "read",
        };
        assert_eq!(
            died.to_string(),
            "gql read worker died while processing the job"
        );
    }

    /// rusqlite errors convert automatically via `#[from]`, so `?` works
    /// against any store call.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }
}
