//! Top-level gateway error taxonomy.
//!
//! Component modules own their error enums; this aggregates them for the
//! request pipeline and assigns the machine-distinguishable codes surfaced to
//! clients, so a well-behaved client can back off or switch providers without
//! human intervention.

use std::sync::Arc;

use thiserror::Error;

use crate::admission::RejectReason;
use crate::limiter::LimiterError;
use crate::provider::{CallError, ProviderError};
use crate::resilience::CircuitOpen;
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Admission refused the connection. Deliberate backpressure, no retry
    /// happens internally.
    #[error("connection rejected: {0}")]
    AdmissionRejected(RejectReason),

    /// The request referenced a connection id that was never admitted (or
    /// was already unregistered).
    #[error("unknown connection {0}")]
    UnknownConnection(String),

    #[error("unknown provider {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The provider's breaker is open; the provider was never invoked.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// This request attached as a waiter and shares the leader's error.
    #[error("{0}")]
    Coalesced(Arc<GatewayError>),
}

impl From<CallError> for GatewayError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::CircuitOpen(open) => GatewayError::CircuitOpen(open),
            CallError::Provider(provider) => GatewayError::Provider(provider),
        }
    }
}

impl GatewayError {
    /// Stable machine-readable code for the error response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AdmissionRejected(reason) => reason.code(),
            GatewayError::UnknownConnection(_) => "unknown_connection",
            GatewayError::UnknownProvider(_) => "unknown_provider",
            GatewayError::Limiter(LimiterError::AcquireTimeout { .. }) => "scope_acquire_timeout",
            GatewayError::Limiter(LimiterError::Closed { .. }) => "scope_closed",
            GatewayError::Session(SessionError::NotFound(_)) => "session_not_found",
            GatewayError::Session(SessionError::ConflictRetriesExhausted { .. }) => {
                "session_version_conflict"
            }
            GatewayError::Session(SessionError::Store(_)) => "session_store_error",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::Provider(e) => e.code(),
            GatewayError::Coalesced(inner) => inner.code(),
        }
    }
}
