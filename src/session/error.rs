//! Session error types.

use thiserror::Error;

use super::store::StoreError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// No session with this id exists (or it has expired).
    #[error("session {0} not found")]
    NotFound(String),

    /// The optimistic-lock retry loop kept losing to concurrent writers.
    #[error("version conflict on session {session_id} persisted after {attempts} attempts")]
    ConflictRetriesExhausted { session_id: String, attempts: u32 },

    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
