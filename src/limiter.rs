//! Scoped concurrency limiting with leak detection.
//!
//! A scope is a named bounded-concurrency domain keyed by `(kind, key)`:
//! one global scope, one per upstream provider, one per session. Acquisition
//! hands back a [`ScopeGuard`] that releases on every exit path, including
//! error paths and cancellation, so the scope counters stay balanced.
//!
//! Every acquisition is tracked as an [`AcquisitionRecord`] carrying its
//! origin context. A periodic diagnostic pass reports unreleased records past
//! the leak threshold; a release without a matching record is logged at error
//! severity and otherwise ignored, because crashing the daemon over one bad
//! release would drop every other in-flight session.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

use crate::config::LimitsConfig;

// ============================================================================
// Scope Keys
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Global,
    Provider,
    Session,
}

/// Identifier for a bounded-concurrency domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub kind: ScopeKind,
    pub name: String,
}

impl ScopeKey {
    pub fn global() -> Self {
        Self {
            kind: ScopeKind::Global,
            name: String::new(),
        }
    }

    pub fn provider(name: &str) -> Self {
        Self {
            kind: ScopeKind::Provider,
            name: name.to_string(),
        }
    }

    pub fn session(id: &str) -> Self {
        Self {
            kind: ScopeKind::Session,
            name: id.to_string(),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ScopeKind::Global => write!(f, "global"),
            ScopeKind::Provider => write!(f, "provider:{}", self.name),
            ScopeKind::Session => write!(f, "session:{}", self.name),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum LimiterError {
    /// Capacity did not free up within the caller's deadline.
    #[error("timed out after {waited_ms}ms waiting for scope {scope}")]
    AcquireTimeout { scope: String, waited_ms: u64 },

    /// The scope's semaphore was closed. Not expected during normal operation.
    #[error("scope {scope} is closed")]
    Closed { scope: String },
}

// ============================================================================
// Acquisition Records
// ============================================================================

/// One outstanding hold on a scope, kept for leak diagnostics.
#[derive(Debug, Clone)]
pub struct AcquisitionRecord {
    pub id: u64,
    pub acquired_at: Instant,
    /// Where the acquisition came from, e.g. `request <id> tool <name>`.
    pub origin: String,
}

// ============================================================================
// Scope State
// ============================================================================

struct ScopeState {
    key: ScopeKey,
    limit: usize,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    total_acquired: AtomicU64,
    total_released: AtomicU64,
    records: DashMap<u64, AcquisitionRecord>,
    last_used_at: Mutex<Instant>,
}

impl ScopeState {
    fn new(key: ScopeKey, limit: usize) -> Self {
        Self {
            key,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            active: AtomicUsize::new(0),
            total_acquired: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
            records: DashMap::new(),
            last_used_at: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn record_acquire(&self, record: AcquisitionRecord) {
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        self.records.insert(record.id, record);
    }

    /// Release the hold identified by `record_id`.
    ///
    /// A release with no matching open acquisition is fatal for that call but
    /// not for the process: it is logged with full context and the counters
    /// are left untouched so the mismatch stays visible in diagnostics.
    fn record_release(&self, record_id: u64) {
        match self.records.remove(&record_id) {
            Some((_, record)) => {
                self.total_released.fetch_add(1, Ordering::Relaxed);
                self.active.fetch_sub(1, Ordering::Relaxed);
                self.touch();
                debug!(
                    scope = %self.key,
                    record_id,
                    held_ms = record.acquired_at.elapsed().as_millis() as u64,
                    "Scope released"
                );
            }
            None => {
                error!(
                    scope = %self.key,
                    record_id,
                    active = self.active.load(Ordering::Relaxed),
                    total_acquired = self.total_acquired.load(Ordering::Relaxed),
                    total_released = self.total_released.load(Ordering::Relaxed),
                    "Release without matching acquisition"
                );
            }
        }
    }

    fn snapshot(&self, leak_threshold: Duration) -> ScopeSnapshot {
        let now = Instant::now();
        let mut leaked = 0;
        let mut oldest_age = Duration::ZERO;
        let mut oldest_origin = None;
        for entry in self.records.iter() {
            let age = now.saturating_duration_since(entry.acquired_at);
            if age >= leak_threshold {
                leaked += 1;
            }
            if age >= oldest_age {
                oldest_age = age;
                oldest_origin = Some(entry.origin.clone());
            }
        }
        ScopeSnapshot {
            scope: self.key.to_string(),
            kind: self.key.kind,
            limit: self.limit,
            active: self.active.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            leaked,
            oldest_unreleased_ms: if self.records.is_empty() {
                None
            } else {
                Some(oldest_age.as_millis() as u64)
            },
            oldest_origin,
        }
    }
}

// ============================================================================
// Scope Guard
// ============================================================================

/// An outstanding acquisition. Dropping the guard releases the scope.
pub struct ScopeGuard {
    scope: Arc<ScopeState>,
    permit: Option<OwnedSemaphorePermit>,
    record_id: u64,
    released: bool,
}

impl std::fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("record_id", &self.record_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl ScopeGuard {
    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.scope.record_release(self.record_id);
        // Returning the permit wakes the next waiter.
        self.permit.take();
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time view of one scope for the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeSnapshot {
    pub scope: String,
    pub kind: ScopeKind,
    pub limit: usize,
    pub active: usize,
    pub total_acquired: u64,
    pub total_released: u64,
    /// Unreleased acquisitions older than the leak threshold.
    pub leaked: usize,
    pub oldest_unreleased_ms: Option<u64>,
    pub oldest_origin: Option<String>,
}

// ============================================================================
// Concurrency Limiter
// ============================================================================

/// Scoped concurrency limiter shared by the whole pipeline.
///
/// Scopes are created lazily on first acquisition. Global and provider scopes
/// live for the process lifetime; session scopes are garbage-collected once
/// idle with no outstanding holds.
pub struct ConcurrencyLimiter {
    scopes: DashMap<ScopeKey, Arc<ScopeState>>,
    limits: LimitsConfig,
    next_record_id: AtomicU64,
}

impl ConcurrencyLimiter {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            scopes: DashMap::new(),
            limits,
            next_record_id: AtomicU64::new(1),
        }
    }

    fn limit_for(&self, kind: ScopeKind) -> usize {
        match kind {
            ScopeKind::Global => self.limits.global,
            ScopeKind::Provider => self.limits.per_provider,
            ScopeKind::Session => self.limits.per_session,
        }
    }

    fn scope(&self, key: &ScopeKey) -> Arc<ScopeState> {
        if let Some(existing) = self.scopes.get(key) {
            return existing.clone();
        }
        self.scopes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ScopeState::new(key.clone(), self.limit_for(key.kind))))
            .clone()
    }

    /// Acquire a hold on `key`, waiting until capacity is available.
    ///
    /// Suspends the calling task only. With a `timeout`, waiting past the
    /// deadline fails with [`LimiterError::AcquireTimeout`] and no counters
    /// are touched.
    pub async fn acquire(
        &self,
        key: ScopeKey,
        origin: &str,
        timeout: Option<Duration>,
    ) -> Result<ScopeGuard, LimiterError> {
        let scope = self.scope(&key);
        scope.touch();

        let acquire = scope.semaphore.clone().acquire_owned();
        let permit = match timeout {
            Some(deadline) => match time::timeout(deadline, acquire).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(scope = %key, waited_ms = deadline.as_millis() as u64, "Scope acquire timed out");
                    return Err(LimiterError::AcquireTimeout {
                        scope: key.to_string(),
                        waited_ms: deadline.as_millis() as u64,
                    });
                }
            },
            None => acquire.await,
        }
        .map_err(|_| LimiterError::Closed {
            scope: key.to_string(),
        })?;

        let record_id = self.next_record_id.fetch_add(1, Ordering::Relaxed);
        scope.record_acquire(AcquisitionRecord {
            id: record_id,
            acquired_at: Instant::now(),
            origin: origin.to_string(),
        });

        Ok(ScopeGuard {
            scope,
            permit: Some(permit),
            record_id,
            released: false,
        })
    }

    /// Snapshot every live scope.
    pub fn snapshot(&self) -> Vec<ScopeSnapshot> {
        let threshold = self.limits.leak_threshold();
        let mut scopes: Vec<ScopeSnapshot> = self
            .scopes
            .iter()
            .map(|entry| entry.value().snapshot(threshold))
            .collect();
        scopes.sort_by(|a, b| a.scope.cmp(&b.scope));
        scopes
    }

    /// Log every suspected leak and return how many were found.
    ///
    /// A leak here is an acquisition older than the configured threshold that
    /// has not been released. The record stays in place so repeated passes
    /// keep reporting it until it resolves.
    pub fn report_leaks(&self) -> usize {
        let threshold = self.limits.leak_threshold();
        let now = Instant::now();
        let mut leaks = 0;
        for entry in self.scopes.iter() {
            for record in entry.value().records.iter() {
                let age = now.saturating_duration_since(record.acquired_at);
                if age >= threshold {
                    leaks += 1;
                    warn!(
                        scope = %entry.key(),
                        record_id = record.id,
                        age_ms = age.as_millis() as u64,
                        origin = %record.origin,
                        "Suspected scope leak"
                    );
                }
            }
        }
        leaks
    }

    /// Drop idle session scopes.
    ///
    /// A session scope is collected once it has no outstanding holds, no
    /// waiting acquirers, and has been unused for the idle TTL. Global and
    /// provider scopes are never collected.
    pub fn gc_idle_sessions(&self) -> usize {
        let ttl = self.limits.idle_scope_ttl();
        let now = Instant::now();
        let mut removed = 0;
        self.scopes.retain(|key, scope| {
            if key.kind != ScopeKind::Session {
                return true;
            }
            // strong_count == 1 means no guard and no waiting acquirer holds
            // this scope, so removal cannot split the limit across two states.
            let idle = {
                let last = *scope.last_used_at.lock().unwrap_or_else(|e| e.into_inner());
                now.saturating_duration_since(last) >= ttl
            };
            let collectable =
                idle && scope.records.is_empty() && Arc::strong_count(scope) == 1;
            if collectable {
                removed += 1;
                debug!(scope = %key, "Collected idle session scope");
            }
            !collectable
        });
        removed
    }

    /// Number of live scopes, for diagnostics.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
