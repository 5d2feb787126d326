//! Durable session storage.
//!
//! The gateway core only depends on the [`SessionStore`] trait; the file
//! implementation below persists one JSON document per session with atomic
//! temp-file-and-rename writes, so a crash mid-write never corrupts a record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use super::record::SessionRecord;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode or decode session record: {0}")]
    Codec(#[from] serde_json::Error),

    /// The conditional write lost to a concurrent writer. The caller must
    /// re-read and retry; the store never merges divergent versions.
    #[error("version conflict for session {session_id}: expected {expected}, found {found}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("session {0} not found")]
    NotFound(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ============================================================================
// SessionStore Trait
// ============================================================================

/// Storage interface for session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a record by id. Returns `Ok(None)` if it doesn't exist.
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Create or overwrite a record unconditionally (upsert semantics).
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Conditionally write `record`, which must carry the already-incremented
    /// version. Fails with [`StoreError::VersionConflict`] unless the stored
    /// version still equals `expected_version`.
    async fn update(
        &self,
        record: &SessionRecord,
        expected_version: u64,
    ) -> Result<SessionRecord, StoreError>;

    /// Enumerate all stored records. Used for startup recovery and sweeps.
    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, session_id: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// FileSessionStore
// ============================================================================

/// File-backed store: `{root}/{session_id}.json` per session.
///
/// Conditional updates take a per-session lock around the read-check-write so
/// two tasks in this process cannot interleave between the version check and
/// the rename.
pub struct FileSessionStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileSessionStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: DashMap::new(),
        }
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_record(&self, path: &Path) -> Result<Option<SessionRecord>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Atomic write: temp file in the same directory, then rename.
    async fn write_record(&self, record: &SessionRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;

        let final_path = self.record_path(&record.session_id);
        let temp_path = self.root.join(format!("{}.json.tmp", record.session_id));

        let json = serde_json::to_string_pretty(record)?;
        fs::write(&temp_path, json.as_bytes())
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| StoreError::io(&final_path, e))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.read_record(&self.record_path(session_id)).await
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let lock = self.lock_for(&record.session_id);
        let _guard = lock.lock().await;
        self.write_record(record).await
    }

    async fn update(
        &self,
        record: &SessionRecord,
        expected_version: u64,
    ) -> Result<SessionRecord, StoreError> {
        let lock = self.lock_for(&record.session_id);
        let _guard = lock.lock().await;

        let current = self
            .read_record(&self.record_path(&record.session_id))
            .await?
            .ok_or_else(|| StoreError::NotFound(record.session_id.clone()))?;

        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                session_id: record.session_id.clone(),
                expected: expected_version,
                found: current.version,
            });
        }

        self.write_record(record).await?;
        Ok(record.clone())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };

        let mut records = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    // A corrupt record must not block recovery of the rest.
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session record");
                }
            }
        }
        Ok(records)
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let lock = self.lock_for(session_id);
        let removed = {
            let _guard = lock.lock().await;
            let path = self.record_path(session_id);
            match fs::remove_file(&path).await {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        };
        self.locks.remove(session_id);
        Ok(removed)
    }
}

// ============================================================================
// Tests
// ============================================================================
