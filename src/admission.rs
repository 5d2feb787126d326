//! Connection admission control.
//!
//! Gates new transport connections before any session exists. A connection is
//! admitted only while both the global count and the per-source count are
//! under their limits; rejections distinguish "server at capacity" from "too
//! many connections from this source" so clients can back off appropriately.
//!
//! Rejection is immediate and final for that connection attempt - there is no
//! internal retry or queueing here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AdmissionConfig;

// ============================================================================
// Decision
// ============================================================================

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The global connection limit is reached.
    GlobalCapacity,
    /// This source address has too many open connections.
    SourceCapacity,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::GlobalCapacity => "admission_global_capacity",
            RejectReason::SourceCapacity => "admission_source_capacity",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::GlobalCapacity => write!(f, "server at capacity"),
            RejectReason::SourceCapacity => {
                write!(f, "too many connections from this source")
            }
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject(RejectReason),
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time admission counters for observability.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub active: usize,
    pub max_global: usize,
    pub max_per_source: usize,
    /// Fraction of the global limit currently in use.
    pub utilization: f64,
    /// Active connection count per source address.
    pub per_source: HashMap<String, usize>,
}

// ============================================================================
// ConnectionAdmission
// ============================================================================

#[derive(Default)]
struct AdmissionState {
    /// Source address per registered connection id.
    connections: HashMap<String, IpAddr>,
    /// Active connection count per source address.
    per_source: HashMap<IpAddr, usize>,
}

/// Admission controller for transport connections.
///
/// All mutations go through the internal mutex so the global and per-source
/// counters can never diverge from the registered connection set.
pub struct ConnectionAdmission {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
}

impl ConnectionAdmission {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    /// Check whether a connection from `source` would be admitted right now.
    ///
    /// Read-only; does not reserve capacity. Use [`register`](Self::register)
    /// for the atomic check-and-count path.
    pub fn decide(&self, source: IpAddr) -> Decision {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::evaluate(&self.config, &state, source)
    }

    /// Atomically admit and count a new connection.
    ///
    /// Re-registering an already-known connection id is a no-op, so transport
    /// layers that retry registration cannot double-count.
    pub fn register(&self, connection_id: &str, source: IpAddr) -> Result<(), RejectReason> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.connections.contains_key(connection_id) {
            debug!(connection_id, "Connection already registered");
            return Ok(());
        }

        if let Decision::Reject(reason) = Self::evaluate(&self.config, &state, source) {
            debug!(
                connection_id,
                source = %source,
                reason = reason.code(),
                active = state.connections.len(),
                "Connection rejected"
            );
            return Err(reason);
        }

        state.connections.insert(connection_id.to_string(), source);
        *state.per_source.entry(source).or_insert(0) += 1;
        debug!(
            connection_id,
            source = %source,
            active = state.connections.len(),
            "Connection admitted"
        );
        Ok(())
    }

    /// Release a connection's slot.
    ///
    /// Idempotent: unregistering an unknown id logs a warning and returns.
    pub fn unregister(&self, connection_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let Some(source) = state.connections.remove(connection_id) else {
            warn!(connection_id, "Unregister for unknown connection id");
            return;
        };

        match state.per_source.get_mut(&source) {
            Some(count) if *count > 1 => *count -= 1,
            _ => {
                state.per_source.remove(&source);
            }
        }
        debug!(
            connection_id,
            source = %source,
            active = state.connections.len(),
            "Connection unregistered"
        );
    }

    /// Whether a connection id is currently registered.
    pub fn is_registered(&self, connection_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.connections.contains_key(connection_id)
    }

    /// Number of currently admitted connections.
    pub fn count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.connections.len()
    }

    /// Point-in-time counters for the diagnostics surface.
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let active = state.connections.len();
        AdmissionSnapshot {
            active,
            max_global: self.config.max_global_connections,
            max_per_source: self.config.max_connections_per_source,
            utilization: active as f64 / self.config.max_global_connections as f64,
            per_source: state
                .per_source
                .iter()
                .map(|(addr, count)| (addr.to_string(), *count))
                .collect(),
        }
    }

    fn evaluate(config: &AdmissionConfig, state: &AdmissionState, source: IpAddr) -> Decision {
        if state.connections.len() >= config.max_global_connections {
            return Decision::Reject(RejectReason::GlobalCapacity);
        }
        let from_source = state.per_source.get(&source).copied().unwrap_or(0);
        if from_source >= config.max_connections_per_source {
            return Decision::Reject(RejectReason::SourceCapacity);
        }
        Decision::Admit
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(max_global: usize, max_per_source: usize) -> ConnectionAdmission {
        ConnectionAdmission::new(AdmissionConfig {
            max_global_connections: max_global,
            max_connections_per_source: max_per_source,
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn admits_under_both_limits() {
        let admission = admission(4, 2);
        assert_eq!(admission.decide(ip(1)), Decision::Admit);
        admission.register("conn-1", ip(1)).unwrap();
        assert_eq!(admission.count(), 1);
    }

    #[test]
    fn per_source_limit_rejects_third_connection_only_for_that_source() {
        let admission = admission(10, 2);
        admission.register("a-1", ip(1)).unwrap();
        admission.register("a-2", ip(1)).unwrap();

        // Third from the same source is rejected...
        let err = admission.register("a-3", ip(1)).unwrap_err();
        assert_eq!(err, RejectReason::SourceCapacity);

        // ...while another source is unaffected.
        admission.register("b-1", ip(2)).unwrap();
        assert_eq!(admission.count(), 3);
    }

    #[test]
    fn global_limit_rejects_regardless_of_source() {
        let admission = admission(2, 10);
        admission.register("a", ip(1)).unwrap();
        admission.register("b", ip(2)).unwrap();

        let err = admission.register("c", ip(3)).unwrap_err();
        assert_eq!(err, RejectReason::GlobalCapacity);
        assert_eq!(admission.decide(ip(4)), Decision::Reject(RejectReason::GlobalCapacity));
    }

    #[test]
    fn unregister_frees_capacity() {
        let admission = admission(10, 1);
        admission.register("a", ip(1)).unwrap();
        assert!(admission.register("b", ip(1)).is_err());

        admission.unregister("a");
        admission.register("b", ip(1)).unwrap();
    }

    #[test]
    fn unregister_unknown_id_is_a_noop() {
        let admission = admission(10, 10);
        admission.unregister("never-registered");
        assert_eq!(admission.count(), 0);
    }

    #[test]
    fn register_is_idempotent_per_connection_id() {
        let admission = admission(10, 2);
        admission.register("a", ip(1)).unwrap();
        admission.register("a", ip(1)).unwrap();

        // Only one slot consumed for the source.
        admission.register("b", ip(1)).unwrap();
        assert_eq!(admission.count(), 2);
    }

    #[test]
    fn snapshot_reports_utilization_and_breakdown() {
        let admission = admission(4, 4);
        admission.register("a", ip(1)).unwrap();
        admission.register("b", ip(1)).unwrap();
        admission.register("c", ip(2)).unwrap();

        let snapshot = admission.snapshot();
        assert_eq!(snapshot.active, 3);
        assert!((snapshot.utilization - 0.75).abs() < f64::EPSILON);
        assert_eq!(snapshot.per_source[&ip(1).to_string()], 2);
        assert_eq!(snapshot.per_source[&ip(2).to_string()], 1);
    }
}
