//! Error types for the colprof scheduler
//!
//! Every failure the queue or a batcher reports is a [`QueryError`]. Errors are
//! `Clone` because a failed batch delivers the same error to each of its
//! constituent entries.
//!
//! # Error Hierarchy
//!
//! ```text
//! QueryError
//! ├── Cancelled          - explicit cancellation (suppress in UI)
//! ├── Transport          - network / server failure, carried verbatim
//! │   └── TransportError
//! └── Duplicate          - key already queued or in flight for the group
//! ```

use thiserror::Error;

/// Failure reported by a [`Transport`](crate::transport::Transport).
///
/// The scheduler never reinterprets these: status and message reach the caller
/// exactly as the transport produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered with a non-success status
    #[error("Server returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never reached the server
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The response could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),

    /// The server executed the batch but this query inside it failed
    #[error("Query failed: {0}")]
    Query(String),
}

impl TransportError {
    /// Create a status error
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a per-query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }
}

/// Outcome of a queued or batched query that did not resolve
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Cancelled before dispatch, or aborted while in flight
    #[error("Query cancelled")]
    Cancelled,

    /// The transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// An entry with the same key is already queued or in flight for this group
    #[error("Duplicate query '{key}' for group '{group}'")]
    Duplicate { group: String, key: String },
}

impl QueryError {
    /// Create a duplicate-key error
    pub fn duplicate(group: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Duplicate {
            group: group.into(),
            key: key.into(),
        }
    }

    /// True for intentionally cancelled work, which callers should not surface
    /// as a user-visible failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
