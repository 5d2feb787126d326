//! Upstream provider abstraction and the per-provider resilience wrapper.
//!
//! [`ModelProvider`] is the seam to the outside world: anything that can turn
//! a tool call into a JSON result. The registry wraps every provider in a
//! [`ResilientProvider`] owning that provider's circuit breaker and retry
//! policy. Breakers are created lazily on first use and never shared across
//! providers, so one failing upstream cannot degrade a healthy one.

mod error;
mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::config::{BreakerConfig, ProviderConfig};
use crate::resilience::{BreakerSnapshot, CircuitBreaker, CircuitOpen, RetryPolicy, retry};

pub use error::ProviderError;
pub use http::HttpToolProvider;

// ============================================================================
// ToolCall
// ============================================================================

/// One provider-bound request, already bound to a session.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub arguments: Value,
    pub session_id: String,
}

// ============================================================================
// ModelProvider Trait
// ============================================================================

/// An upstream capable of executing tool calls.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn invoke(&self, call: &ToolCall) -> Result<Value, ProviderError>;
}

// ============================================================================
// CallError
// ============================================================================

/// Outcome of a resilient provider call.
#[derive(Debug, Error)]
pub enum CallError {
    /// Rejected before reaching the provider; deliberate backpressure.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    /// The provider failed after retries were exhausted (or the error was
    /// classified non-retryable).
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

// ============================================================================
// ResilientProvider
// ============================================================================

/// A provider wrapped in its own circuit breaker and retry policy.
///
/// The breaker is consulted first: while open, the call fails fast and the
/// wrapped provider is never invoked. Permitted calls run through the retry
/// handler, and the composed outcome drives the breaker.
pub struct ResilientProvider {
    name: String,
    inner: Arc<dyn ModelProvider>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ResilientProvider {
    pub fn new(
        name: &str,
        inner: Arc<dyn ModelProvider>,
        breaker_config: BreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            inner,
            breaker: CircuitBreaker::new(name, breaker_config),
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn invoke(&self, call: &ToolCall) -> Result<Value, CallError> {
        self.breaker.try_acquire()?;

        let op = |_attempt: u32| {
            let inner = self.inner.clone();
            let call = call.clone();
            async move { inner.invoke(&call).await }
        };
        let result = retry(&self.retry, op, ProviderError::is_retryable).await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result.map_err(CallError::Provider)
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }
}

// ============================================================================
// ProviderRegistry
// ============================================================================

/// Registry of configured upstream providers.
///
/// Holds a shared `reqwest::Client` so all HTTP providers pool connections.
/// Resilient wrappers (and with them, breakers) are built lazily the first
/// time a provider is used.
#[derive(Clone)]
pub struct ProviderRegistry {
    active: Arc<DashMap<String, Arc<ResilientProvider>>>,
    configs: Arc<HashMap<String, ProviderConfig>>,
    default_breaker: BreakerConfig,
    retry: RetryPolicy,
    client: Client,
}

impl ProviderRegistry {
    pub fn from_config(
        configs: HashMap<String, ProviderConfig>,
        default_breaker: BreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        for name in configs.keys() {
            info!(provider = %name, "Provider configured");
        }
        Self {
            active: Arc::new(DashMap::new()),
            configs: Arc::new(configs),
            default_breaker,
            retry,
            client: Client::new(),
        }
    }

    /// Register a provider implementation directly, bypassing the HTTP
    /// defaults. Used for in-process providers and tests.
    pub fn register(
        &self,
        name: &str,
        provider: Arc<dyn ModelProvider>,
        breaker: Option<BreakerConfig>,
    ) {
        let wrapped = Arc::new(ResilientProvider::new(
            name,
            provider,
            breaker.unwrap_or_else(|| self.default_breaker.clone()),
            self.retry.clone(),
        ));
        self.active.insert(name.to_string(), wrapped);
    }

    /// Look up a provider, instantiating it from config on first use.
    pub fn get(&self, name: &str) -> Option<Arc<ResilientProvider>> {
        if let Some(provider) = self.active.get(name) {
            return Some(provider.clone());
        }
        let config = self.configs.get(name)?;
        let provider = self
            .active
            .entry(name.to_string())
            .or_insert_with(|| {
                let inner = Arc::new(HttpToolProvider::new(
                    name,
                    &config.base_url,
                    self.client.clone(),
                ));
                Arc::new(ResilientProvider::new(
                    name,
                    inner,
                    config
                        .breaker
                        .clone()
                        .unwrap_or_else(|| self.default_breaker.clone()),
                    self.retry.clone(),
                ))
            })
            .clone();
        Some(provider)
    }

    /// Breaker snapshots for every provider used so far.
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .active
            .iter()
            .map(|entry| entry.value().breaker_snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BreakerState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use serde_json::json;

    /// Provider that fails a scripted number of times before succeeding.
    struct FlakyProvider {
        calls: AtomicU32,
        failures_before_success: u32,
        error: ProviderError,
    }

    impl FlakyProvider {
        fn new(failures_before_success: u32, error: ProviderError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success,
                error,
            }
        }
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        async fn invoke(&self, call: &ToolCall) -> Result<Value, ProviderError> {
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            if call_index < self.failures_before_success {
                Err(self.error.clone())
            } else {
                Ok(json!({ "tool": call.tool, "call": call_index }))
            }
        }
    }

    fn retry_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(100),
            jitter: false,
        }
    }

    fn breaker_config(failure_threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            success_threshold: 1,
            open_timeout_seconds: 30,
        }
    }

    fn call() -> ToolCall {
        ToolCall {
            tool: "search".to_string(),
            arguments: json!({ "q": "rust" }),
            session_id: "ses_test".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_inside_one_breaker_outcome() {
        let flaky = Arc::new(FlakyProvider::new(
            2,
            ProviderError::Server {
                status: 503,
                message: "overloaded".into(),
            },
        ));
        let provider = ResilientProvider::new(
            "flaky",
            flaky.clone(),
            breaker_config(1),
            retry_policy(3),
        );

        // Two failures are absorbed by the retry handler; the breaker sees
        // one composed success and stays closed.
        provider.invoke(&call()).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(provider.breaker_snapshot().state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_the_provider() {
        let flaky = Arc::new(FlakyProvider::new(
            u32::MAX,
            ProviderError::Server {
                status: 500,
                message: "down".into(),
            },
        ));
        let provider = ResilientProvider::new(
            "down",
            flaky.clone(),
            breaker_config(1),
            retry_policy(2),
        );

        let err = provider.invoke(&call()).await.unwrap_err();
        assert!(matches!(err, CallError::Provider(_)));
        let calls_after_failure = flaky.calls.load(Ordering::SeqCst);
        assert_eq!(calls_after_failure, 2);
        assert_eq!(provider.breaker_snapshot().state, BreakerState::Open);

        // While open the wrapped provider is never invoked.
        let err = provider.invoke(&call()).await.unwrap_err();
        assert!(matches!(err, CallError::CircuitOpen(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), calls_after_failure);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let flaky = Arc::new(FlakyProvider::new(
            u32::MAX,
            ProviderError::Client {
                status: 400,
                message: "bad arguments".into(),
            },
        ));
        let provider = ResilientProvider::new(
            "strict",
            flaky.clone(),
            breaker_config(5),
            retry_policy(4),
        );

        let err = provider.invoke(&call()).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Provider(ProviderError::Client { .. })
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registry_builds_providers_lazily_from_config() {
        let mut configs = HashMap::new();
        configs.insert(
            "openai".to_string(),
            ProviderConfig {
                base_url: "http://localhost:9999".to_string(),
                breaker: None,
            },
        );
        let registry =
            ProviderRegistry::from_config(configs, breaker_config(5), retry_policy(1));

        assert!(registry.breaker_snapshots().is_empty());
        assert!(registry.get("openai").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.breaker_snapshots().len(), 1);
    }

    #[tokio::test]
    async fn registered_provider_takes_precedence() {
        let registry = ProviderRegistry::from_config(
            HashMap::new(),
            breaker_config(5),
            retry_policy(1),
        );
        registry.register(
            "mock",
            Arc::new(FlakyProvider::new(
                0,
                ProviderError::Timeout,
            )),
            None,
        );

        let provider = registry.get("mock").unwrap();
        let result = provider.invoke(&call()).await.unwrap();
        assert_eq!(result["tool"], "search");
    }
}
