//! Typed error hierarchy for the canteen engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — transport-level failures from the document store
//! - `SyncError` — retry/timeout envelope failures from the sync layer
//! - `SessionError` — domain validation and joinability failures

use std::time::Duration;
use thiserror::Error;

/// Transport-level errors from a [`crate::store::DocumentStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend cannot be reached at all (offline, not merely slow).
    #[error("Document store unavailable")]
    Unavailable,

    #[error("Store operation timed out")]
    Timeout,

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this failure means the backend is down rather than flaky.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable)
    }
}

/// Errors from the sync layer after its resilience policy has run out.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Operation timed out after {waited:?}")]
    Timeout { waited: Duration },

    #[error("Sync failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// The last underlying transport cause, if one was recorded.
    pub fn last_cause(&self) -> Option<&StoreError> {
        match self {
            SyncError::Exhausted { source, .. } => Some(source),
            SyncError::Store(source) => Some(source),
            SyncError::Timeout { .. } => None,
        }
    }
}

/// Domain-level errors surfaced to the UI layer.
///
/// Validation variants are rejected locally before any remote write is
/// attempted. `NotJoinable` is deliberately distinct from network failure:
/// a missing or closed session is an answer, not an outage.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Display name must not be empty")]
    EmptyName,

    #[error("Deadline is invalid: {0}")]
    InvalidDeadline(String),

    #[error("Order must contain at least one item")]
    EmptyOrder,

    #[error("No restaurant or drink shop has been selected yet")]
    SourceNotSelected,

    #[error("The ordering deadline has passed")]
    DeadlineClosed,

    #[error("The session has been closed by the admin")]
    SessionClosed,

    #[error("Session {session_id} is not joinable: {reason}")]
    NotJoinable { session_id: String, reason: String },

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Only the session admin may {action}")]
    NotAdmin { action: String },

    #[error("No pending write to retry")]
    NothingToRetry,

    #[error(transparent)]
    Sync(#[from] SyncError),
}
