//! Session record types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Prefix for generated session ids.
pub const SESSION_ID_PREFIX: &str = "ses_";

// ============================================================================
// SessionState
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// A transport connection is currently bound to the session.
    Connected,
    /// The connection dropped; the session is waiting for a reconnect.
    Disconnected,
    /// Past `expires_at`; kept only until the sweep deletes it.
    Expired,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

// ============================================================================
// SessionRecord
// ============================================================================

/// Persisted session state.
///
/// `version` is the optimistic-concurrency counter: it increments by exactly
/// one on every successful mutation, and conditional writes are rejected when
/// it moved underneath the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub owner_id: String,
    pub state: SessionState,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub request_count: u64,
    pub total_duration_ms: u64,
}

impl SessionRecord {
    /// Create a fresh record for `owner_id`.
    ///
    /// The id is generated server-side from the thread-local CSPRNG (via
    /// ULID), never derived from client input.
    pub fn new(owner_id: &str, timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("{}{}", SESSION_ID_PREFIX, Ulid::new()),
            owner_id: owner_id.to_string(),
            state: SessionState::Connected,
            version: 1,
            created_at: now,
            last_active_at: now,
            expires_at: now + chrono::Duration::milliseconds(timeout.as_millis() as i64),
            request_count: 0,
            total_duration_ms: 0,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Refresh activity and push the expiry out by `timeout`.
    pub fn touch(&mut self, timeout: Duration) {
        let now = Utc::now();
        self.last_active_at = now;
        self.expires_at = now + chrono::Duration::milliseconds(timeout.as_millis() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_has_prefixed_unique_id() {
        let a = SessionRecord::new("owner-1", Duration::from_secs(60));
        let b = SessionRecord::new("owner-1", Duration::from_secs(60));
        assert!(a.session_id.starts_with(SESSION_ID_PREFIX));
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.version, 1);
        assert_eq!(a.state, SessionState::Connected);
    }

    #[test]
    fn expiry_tracks_touch() {
        let mut record = SessionRecord::new("owner-1", Duration::from_secs(60));
        assert!(!record.is_expired_at(Utc::now()));
        assert!(record.is_expired_at(Utc::now() + chrono::Duration::seconds(61)));

        let old_expiry = record.expires_at;
        record.touch(Duration::from_secs(120));
        assert!(record.expires_at > old_expiry);
    }
}
