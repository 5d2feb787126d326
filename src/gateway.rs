//! Request pipeline tying admission, sessions, limits, coalescing and
//! providers together.
//!
//! A request flows: connection check, session resolution, fingerprinting,
//! then coalesced execution. Only the coalescing leader acquires concurrency
//! scopes and invokes the provider; waiters park on the shared entry and
//! receive the leader's outcome. Scope acquisition is strictly ordered
//! (session, then global, then provider) so two requests can never hold the
//! scopes in opposite orders.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionSnapshot, ConnectionAdmission};
use crate::coalesce::{CoalescerSnapshot, RequestCoalescer};
use crate::config::Config;
use crate::error::GatewayError;
use crate::limiter::{ConcurrencyLimiter, ScopeKey, ScopeSnapshot};
use crate::provider::{ProviderRegistry, ToolCall};
use crate::resilience::{BreakerSnapshot, RetryPolicy};
use crate::session::{
    ActivityDelta, SessionDiagnostics, SessionManager, SessionRecord, SessionStore,
};

// ============================================================================
// Request / Response
// ============================================================================

/// One inbound tool request, already attributed to a connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub request_id: String,
    #[serde(skip_deserializing)]
    pub connection_id: String,
    pub owner_id: String,
    /// Omit to start a fresh session.
    pub session_id: Option<String>,
    pub provider: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub request_id: String,
    pub session_id: String,
    pub provider: String,
    pub result: Value,
}

/// Point-in-time view over every component, for the diagnostics endpoint.
#[derive(Debug, Serialize)]
pub struct GatewayDiagnostics {
    pub admission: AdmissionSnapshot,
    pub scopes: Vec<ScopeSnapshot>,
    pub breakers: Vec<BreakerSnapshot>,
    pub coalescer: CoalescerSnapshot,
    pub sessions: SessionDiagnostics,
}

// ============================================================================
// Gateway
// ============================================================================

pub struct Gateway {
    admission: ConnectionAdmission,
    sessions: Arc<SessionManager>,
    limiter: Arc<ConcurrencyLimiter>,
    coalescer: RequestCoalescer<Value, Arc<GatewayError>>,
    providers: ProviderRegistry,
    acquire_timeout: Duration,
}

impl Gateway {
    pub fn new(config: &Config, store: Arc<dyn SessionStore>) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            admission: ConnectionAdmission::new(config.admission.clone()),
            sessions: Arc::new(SessionManager::new(store, config.session.clone())),
            limiter: Arc::new(ConcurrencyLimiter::new(config.limits.clone())),
            coalescer: RequestCoalescer::new(config.coalesce.ttl()),
            providers: ProviderRegistry::from_config(
                config.providers.clone(),
                config.breaker.clone(),
                retry,
            ),
            acquire_timeout: config.limits.acquire_timeout(),
        }
    }

    pub fn admission(&self) -> &ConnectionAdmission {
        &self.admission
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Reload persisted sessions after a restart. Returns how many were
    /// brought back.
    pub async fn recover(&self) -> Result<usize, GatewayError> {
        let recovered = self.sessions.recover_all().await?;
        if recovered > 0 {
            info!(recovered, "Sessions recovered from store");
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------------
    // Request handling
    // ------------------------------------------------------------------------

    pub async fn handle(&self, request: ToolRequest) -> Result<ToolResponse, GatewayError> {
        if !self.admission.is_registered(&request.connection_id) {
            return Err(GatewayError::UnknownConnection(request.connection_id));
        }

        let session = self
            .sessions
            .ensure(request.session_id.as_deref(), &request.owner_id)
            .await?;
        let fingerprint = fingerprint(&request.tool, &request.arguments, &session.session_id);
        debug!(
            request_id = %request.request_id,
            session_id = %session.session_id,
            provider = %request.provider,
            tool = %request.tool,
            fingerprint = %fingerprint,
            "Dispatching tool request"
        );

        let started = Instant::now();
        let outcome = self
            .coalescer
            .submit(&fingerprint, || self.execute(&request, &session))
            .await;
        let result = outcome.map_err(|shared| {
            // Hand the sole owner its error back unwrapped; waiters sharing
            // the leader's error get the coalesced form.
            Arc::try_unwrap(shared).unwrap_or_else(GatewayError::Coalesced)
        })?;

        self.record_activity(&session.session_id, started.elapsed())
            .await;

        Ok(ToolResponse {
            request_id: request.request_id,
            session_id: session.session_id.clone(),
            provider: request.provider,
            result,
        })
    }

    /// The coalescing leader's path: acquire scopes in order, then invoke the
    /// resilient provider. Guards release on every exit, including
    /// cancellation.
    async fn execute(
        &self,
        request: &ToolRequest,
        session: &SessionRecord,
    ) -> Result<Value, Arc<GatewayError>> {
        let origin = format!("request {} tool {}", request.request_id, request.tool);
        let timeout = Some(self.acquire_timeout);

        let _session_slot = self
            .limiter
            .acquire(ScopeKey::session(&session.session_id), &origin, timeout)
            .await
            .map_err(|e| Arc::new(GatewayError::from(e)))?;
        let _global_slot = self
            .limiter
            .acquire(ScopeKey::global(), &origin, timeout)
            .await
            .map_err(|e| Arc::new(GatewayError::from(e)))?;
        let _provider_slot = self
            .limiter
            .acquire(ScopeKey::provider(&request.provider), &origin, timeout)
            .await
            .map_err(|e| Arc::new(GatewayError::from(e)))?;

        let provider = self
            .providers
            .get(&request.provider)
            .ok_or_else(|| Arc::new(GatewayError::UnknownProvider(request.provider.clone())))?;

        let call = ToolCall {
            tool: request.tool.clone(),
            arguments: request.arguments.clone(),
            session_id: session.session_id.clone(),
        };
        provider
            .invoke(&call)
            .await
            .map_err(|e| Arc::new(GatewayError::from(e)))
    }

    /// Fold the finished request into the session record. Activity accounting
    /// must not fail a request whose provider call already succeeded, so
    /// exhausted conflicts are logged and dropped here.
    async fn record_activity(&self, session_id: &str, elapsed: Duration) {
        let delta = ActivityDelta {
            requests: 1,
            duration: elapsed,
            state: None,
        };
        if let Err(error) = self.sessions.update_activity(session_id, delta).await {
            warn!(session_id = %session_id, %error, "Failed to record session activity");
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One periodic housekeeping pass over the in-memory components.
    pub fn maintenance_pass(&self) {
        let leaks = self.limiter.report_leaks();
        let collected = self.limiter.gc_idle_sessions();
        let evicted = self.coalescer.evict_expired();
        if leaks > 0 || collected > 0 || evicted > 0 {
            debug!(leaks, collected, evicted, "Maintenance pass");
        }
    }

    /// Delete expired sessions from the store and the index.
    pub async fn sweep_sessions(&self) -> usize {
        self.sessions.sweep_expired().await
    }

    pub fn diagnostics(&self) -> GatewayDiagnostics {
        GatewayDiagnostics {
            admission: self.admission.snapshot(),
            scopes: self.limiter.snapshot(),
            breakers: self.providers.breaker_snapshots(),
            coalescer: self.coalescer.snapshot(),
            sessions: self.sessions.diagnostics(),
        }
    }
}

// ============================================================================
// Fingerprinting
// ============================================================================

/// Stable fingerprint for request coalescing.
///
/// `serde_json::Value` maps iterate in sorted key order, so semantically
/// identical argument objects hash identically regardless of how the client
/// ordered its keys. Length prefixes keep field boundaries unambiguous.
fn fingerprint(tool: &str, arguments: &Value, session_id: &str) -> String {
    let canonical = arguments.to_string();
    let mut hasher = Sha256::new();
    hasher.update((tool.len() as u64).to_be_bytes());
    hasher.update(tool.as_bytes());
    hasher.update((canonical.len() as u64).to_be_bytes());
    hasher.update(canonical.as_bytes());
    hasher.update(session_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Tests
// ============================================================================
