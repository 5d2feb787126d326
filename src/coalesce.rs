//! Request coalescing: one execution serves all concurrent identical requests.
//!
//! Requests are keyed by a fingerprint (a stable hash of tool name, arguments,
//! and session scope, computed by the caller). The first submission of a
//! fingerprint becomes the leader and executes the operation; every
//! submission arriving before resolution attaches as a waiter on a `watch`
//! channel and receives the identical outcome, success or error, without
//! re-invoking the operation.
//!
//! Resolved entries stay servable for a TTL so near-simultaneous duplicates
//! still short-circuit, then are evicted lazily on access and by the periodic
//! maintenance pass. A leader cancelled mid-flight drops its channel sender,
//! which wakes the waiters; one of them takes over with its own operation.

use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

// ============================================================================
// Entry
// ============================================================================

struct Entry<T, E> {
    rx: watch::Receiver<Option<Result<T, E>>>,
    resolved_at: Mutex<Option<Instant>>,
}

impl<T, E> Entry<T, E> {
    fn new(rx: watch::Receiver<Option<Result<T, E>>>) -> Self {
        Self {
            rx,
            resolved_at: Mutex::new(None),
        }
    }

    fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        let resolved_at = self.resolved_at.lock().unwrap_or_else(|e| e.into_inner());
        match *resolved_at {
            Some(at) => at.elapsed() >= ttl,
            None => false,
        }
    }

    /// A pending entry whose leader dropped the sender without resolving.
    fn is_abandoned(&self) -> bool {
        !self.is_resolved() && self.rx.has_changed().is_err()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CoalescerSnapshot {
    /// Entries whose operation is still in flight.
    pub pending: usize,
    /// Resolved entries still within their TTL.
    pub resolved: usize,
}

// ============================================================================
// RequestCoalescer
// ============================================================================

enum Role<T, E> {
    Leader(watch::Sender<Option<Result<T, E>>>),
    Waiter(watch::Receiver<Option<Result<T, E>>>),
    Done(Result<T, E>),
}

/// Deduplicates concurrent identical requests by fingerprint.
pub struct RequestCoalescer<T, E> {
    entries: DashMap<String, Entry<T, E>>,
    ttl: Duration,
}

impl<T, E> RequestCoalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Submit a request under `fingerprint`.
    ///
    /// Exactly one concurrent caller per fingerprint executes its operation;
    /// the rest receive the leader's outcome. `make_op` is only invoked if
    /// this caller ends up leading.
    pub async fn submit<F, Fut>(&self, fingerprint: &str, make_op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut op = Some(make_op);
        loop {
            // Create-or-attach must be atomic: the entry API holds the shard
            // lock, so two callers can never both believe they are first.
            // No suspension happens inside this block.
            let role = match self.entries.entry(fingerprint.to_string()) {
                MapEntry::Occupied(mut occupied) => {
                    let resolved = occupied.get().rx.borrow().clone();
                    match resolved {
                        Some(_) if occupied.get().is_expired(self.ttl) => {
                            let (tx, rx) = watch::channel(None);
                            *occupied.get_mut() = Entry::new(rx);
                            Role::Leader(tx)
                        }
                        Some(outcome) => Role::Done(outcome),
                        // Previous leader was cancelled; take over.
                        None if occupied.get().is_abandoned() => {
                            let (tx, rx) = watch::channel(None);
                            *occupied.get_mut() = Entry::new(rx);
                            Role::Leader(tx)
                        }
                        None => Role::Waiter(occupied.get().rx.clone()),
                    }
                }
                MapEntry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(Entry::new(rx));
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Done(outcome) => {
                    debug!(fingerprint, "Served from resolved coalescing entry");
                    return outcome;
                }
                Role::Leader(tx) => {
                    let make_op = op.take().expect("leader role granted twice");
                    let outcome = make_op().await;
                    if let Some(entry) = self.entries.get(fingerprint) {
                        *entry
                            .resolved_at
                            .lock()
                            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                    }
                    // Waiters observe the outcome through the channel; the
                    // send also keeps serving late duplicates until the TTL.
                    tx.send_replace(Some(outcome.clone()));
                    return outcome;
                }
                Role::Waiter(mut rx) => {
                    debug!(fingerprint, "Attached as coalescing waiter");
                    loop {
                        if let Some(outcome) = rx.borrow().clone() {
                            return outcome;
                        }
                        if rx.changed().await.is_err() {
                            // Leader cancelled before resolving; retry from
                            // the top, possibly becoming the new leader.
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Remove resolved entries past their TTL. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !(entry.is_resolved() && entry.is_expired(self.ttl)));
        before - self.entries.len()
    }

    /// Number of fingerprints with an operation still in flight.
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.is_resolved())
            .count()
    }

    pub fn snapshot(&self) -> CoalescerSnapshot {
        let mut pending = 0;
        let mut resolved = 0;
        for entry in self.entries.iter() {
            if entry.is_resolved() {
                resolved += 1;
            } else {
                pending += 1;
            }
        }
        CoalescerSnapshot { pending, resolved }
    }
}

// ============================================================================
// Tests
// ============================================================================
