//! Session manager: identity, activity tracking, recovery, expiry.
//!
//! The manager keeps an in-memory index in front of the durable store. All
//! mutations flow through an explicit bounded read-modify-conditional-write
//! loop: a version conflict means a concurrent writer won, so the manager
//! re-reads and reapplies its delta rather than overwriting blindly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;

use super::error::SessionError;
use super::record::{SessionRecord, SessionState};
use super::store::{SessionStore, StoreError};

// ============================================================================
// ActivityDelta
// ============================================================================

/// A mutation applied to a session under optimistic locking.
#[derive(Debug, Clone, Default)]
pub struct ActivityDelta {
    /// Requests to add to the running count.
    pub requests: u64,
    /// Wall-clock work to add to the session's total duration.
    pub duration: Duration,
    /// New connection state, if it changed.
    pub state: Option<SessionState>,
}

// ============================================================================
// Diagnostics
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub active_sessions: usize,
    pub recovered_count: usize,
}

// ============================================================================
// SessionManager
// ============================================================================

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    index: DashMap<String, SessionRecord>,
    config: SessionConfig,
    recovered: AtomicUsize,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self {
            store,
            index: DashMap::new(),
            config,
            recovered: AtomicUsize::new(0),
        }
    }

    /// Create a new session for `owner_id` and persist it before returning.
    pub async fn create(&self, owner_id: &str) -> Result<SessionRecord, SessionError> {
        let record = SessionRecord::new(owner_id, self.config.timeout());
        self.store.save(&record).await?;
        self.index.insert(record.session_id.clone(), record.clone());
        info!(
            session_id = %record.session_id,
            owner_id,
            "Session created"
        );
        Ok(record)
    }

    /// Bind a request to a session: load the referenced session, or create a
    /// fresh one when the client didn't name any.
    ///
    /// Naming an unknown or expired session fails with `NotFound`; ids are
    /// generated server-side, so the gateway never materializes a session
    /// under a client-chosen id.
    pub async fn ensure(
        &self,
        session_id: Option<&str>,
        owner_id: &str,
    ) -> Result<SessionRecord, SessionError> {
        let Some(id) = session_id else {
            return self.create(owner_id).await;
        };

        if let Some(record) = self.get(id).await? {
            if record.is_expired_at(Utc::now()) {
                return Err(SessionError::NotFound(id.to_string()));
            }
            return Ok(record);
        }
        Err(SessionError::NotFound(id.to_string()))
    }

    /// Look up a session, falling back to the store on an index miss.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        if let Some(record) = self.index.get(session_id) {
            return Ok(Some(record.clone()));
        }
        match self.store.load(session_id).await? {
            Some(record) => {
                self.index.insert(session_id.to_string(), record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Apply `delta` under optimistic locking.
    ///
    /// Reads the current version, applies the mutation, and writes back
    /// conditioned on the version being unchanged. A conflict triggers a
    /// re-read and bounded retry; the delta is never lost and a concurrent
    /// update is never overwritten.
    pub async fn update_activity(
        &self,
        session_id: &str,
        delta: ActivityDelta,
    ) -> Result<SessionRecord, SessionError> {
        let attempts = self.config.update_retries + 1;
        for attempt in 0..attempts {
            let current = self
                .get(session_id)
                .await?
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

            let mut next = current.clone();
            next.version = current.version + 1;
            next.request_count += delta.requests;
            next.total_duration_ms += delta.duration.as_millis() as u64;
            if let Some(state) = delta.state {
                next.state = state;
            }
            next.touch(self.config.timeout());

            match self.store.update(&next, current.version).await {
                Ok(stored) => {
                    self.index.insert(session_id.to_string(), stored.clone());
                    return Ok(stored);
                }
                Err(StoreError::VersionConflict { found, .. }) => {
                    debug!(
                        session_id,
                        attempt,
                        expected = current.version,
                        found,
                        "Version conflict, re-reading"
                    );
                    // Drop the stale index entry so the next read hits the store.
                    self.index.remove(session_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SessionError::ConflictRetriesExhausted {
            session_id: session_id.to_string(),
            attempts,
        })
    }

    /// Remove a session from the index and the store.
    pub async fn remove(&self, session_id: &str) -> Result<bool, SessionError> {
        self.index.remove(session_id);
        Ok(self.store.delete(session_id).await?)
    }

    /// Load all non-expired sessions from the store into the index.
    ///
    /// Called once at startup; enables continuity across a restart without
    /// client-visible session loss.
    pub async fn recover_all(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let mut recovered = 0;
        let mut skipped = 0;
        for mut record in self.store.list().await? {
            if record.is_expired_at(now) {
                skipped += 1;
                continue;
            }
            // Connections do not survive the restart.
            if record.state == SessionState::Connected {
                record.state = SessionState::Disconnected;
            }
            self.index.insert(record.session_id.clone(), record);
            recovered += 1;
        }
        self.recovered.store(recovered, Ordering::Relaxed);
        if recovered > 0 || skipped > 0 {
            info!(recovered, skipped, "Session recovery complete");
        }
        Ok(recovered)
    }

    /// Delete expired sessions from both the index and the store.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = match self.store.list().await {
            Ok(records) => records
                .into_iter()
                .filter(|r| r.is_expired_at(now))
                .map(|r| r.session_id)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Expiry sweep could not list the store");
                Vec::new()
            }
        };

        let mut removed = 0;
        for session_id in expired {
            self.index.remove(&session_id);
            match self.store.delete(&session_id).await {
                Ok(_) => {
                    removed += 1;
                    debug!(session_id = %session_id, "Expired session deleted");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to delete expired session");
                }
            }
        }

        // Index entries can outlive their store record only transiently; drop
        // any that expired without a backing file.
        self.index.retain(|_, record| !record.is_expired_at(now));

        if removed > 0 {
            info!(removed, "Expired sessions swept");
        }
        removed
    }

    pub fn active_sessions(&self) -> usize {
        self.index.len()
    }

    /// All indexed sessions, newest first.
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> =
            self.index.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            active_sessions: self.index.len(),
            recovered_count: self.recovered.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FileSessionStore;
    use tempfile::TempDir;

    fn manager_with(temp_dir: &TempDir, timeout_seconds: u64) -> SessionManager {
        let store = Arc::new(FileSessionStore::new(temp_dir.path().join("sessions")));
        SessionManager::new(
            store,
            SessionConfig {
                path: temp_dir.path().join("sessions"),
                timeout_seconds,
                cleanup_interval_seconds: 60,
                update_retries: 3,
            },
        )
    }

    #[tokio::test]
    async fn ensure_without_id_creates_a_session() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager_with(&temp_dir, 3600);

        let record = manager.ensure(None, "owner-1").await.unwrap();
        assert!(record.session_id.starts_with("ses_"));
        assert_eq!(manager.active_sessions(), 1);

        // And it is durable immediately.
        let loaded = manager.get(&record.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, "owner-1");
    }

    #[tokio::test]
    async fn ensure_with_unknown_id_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager_with(&temp_dir, 3600);

        let err = manager.ensure(Some("ses_unknown"), "owner-1").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_activity_increments_version_by_one() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager_with(&temp_dir, 3600);
        let record = manager.create("owner-1").await.unwrap();

        let updated = manager
            .update_activity(
                &record.session_id,
                ActivityDelta {
                    requests: 1,
                    duration: Duration::from_millis(250),
                    state: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.version, record.version + 1);
        assert_eq!(updated.request_count, 1);
        assert_eq!(updated.total_duration_ms, 250);
    }

    #[tokio::test]
    async fn concurrent_updates_both_land_via_retry() {
        let temp_dir = TempDir::new().unwrap();
        let manager = Arc::new(manager_with(&temp_dir, 3600));
        let record = manager.create("owner-1").await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let manager = manager.clone();
            let id = record.session_id.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .update_activity(
                        &id,
                        ActivityDelta {
                            requests: 1,
                            ..Default::default()
                        },
                    )
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Exactly one version increment per successful mutation, and neither
        // delta was lost to the conflict.
        let final_record = manager.get(&record.session_id).await.unwrap().unwrap();
        assert_eq!(final_record.version, record.version + 2);
        assert_eq!(final_record.request_count, 2);
    }

    #[tokio::test]
    async fn stale_writer_receives_conflict_from_the_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileSessionStore::new(temp_dir.path().join("sessions")));
        let manager = SessionManager::new(
            store.clone(),
            SessionConfig {
                path: temp_dir.path().join("sessions"),
                timeout_seconds: 3600,
                cleanup_interval_seconds: 60,
                update_retries: 3,
            },
        );
        let record = manager.create("owner-1").await.unwrap();

        // A writer that read version 1 loses once version 2 is persisted.
        let mut winner = record.clone();
        winner.version = 2;
        store.update(&winner, 1).await.unwrap();

        let mut stale = record.clone();
        stale.version = 2;
        let err = store.update(&stale, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        // The manager path retries against the new version and succeeds.
        let updated = manager
            .update_activity(
                &record.session_id,
                ActivityDelta {
                    requests: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 3);
    }

    #[tokio::test]
    async fn recover_all_loads_non_expired_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let live_id;
        {
            let manager = manager_with(&temp_dir, 3600);
            live_id = manager.create("owner-1").await.unwrap().session_id;

            // An already-expired record on disk is skipped on recovery.
            let expired_manager = manager_with(&temp_dir, 1);
            let mut expired = SessionRecord::new("owner-2", Duration::from_secs(1));
            expired.expires_at = Utc::now() - chrono::Duration::seconds(10);
            expired_manager
                .store
                .save(&expired)
                .await
                .unwrap();
        }

        // Simulated restart: a fresh manager over the same directory.
        let manager = manager_with(&temp_dir, 3600);
        assert_eq!(manager.active_sessions(), 0);
        let recovered = manager.recover_all().await.unwrap();
        assert_eq!(recovered, 1);

        let record = manager.get(&live_id).await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Disconnected);
        assert_eq!(manager.diagnostics().recovered_count, 1);
    }

    #[tokio::test]
    async fn sweep_deletes_expired_sessions_everywhere() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager_with(&temp_dir, 3600);
        let keep = manager.create("owner-1").await.unwrap();

        let mut expired = SessionRecord::new("owner-2", Duration::from_secs(1));
        expired.expires_at = Utc::now() - chrono::Duration::seconds(10);
        manager.store.save(&expired).await.unwrap();
        manager
            .index
            .insert(expired.session_id.clone(), expired.clone());

        assert_eq!(manager.sweep_expired().await, 1);
        assert!(manager.get(&expired.session_id).await.unwrap().is_none());
        assert!(manager.get(&keep.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_deletes_index_and_store() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager_with(&temp_dir, 3600);
        let record = manager.create("owner-1").await.unwrap();

        assert!(manager.remove(&record.session_id).await.unwrap());
        assert!(manager.get(&record.session_id).await.unwrap().is_none());
        assert!(!manager.remove(&record.session_id).await.unwrap());
    }
}
