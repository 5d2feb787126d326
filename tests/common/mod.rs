//! Common test utilities.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use axum::Router;
use serde_json::{Value, json};
use tempfile::TempDir;

use modelmux::config::Config;
use modelmux::gateway::Gateway;
use modelmux::provider::{ModelProvider, ProviderError, ToolCall};
use modelmux::server::{self, AppState};
use modelmux::session::FileSessionStore;

/// In-process provider that counts invocations and echoes the tool name.
pub struct EchoProvider {
    pub calls: AtomicU32,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ModelProvider for EchoProvider {
    async fn invoke(&self, call: &ToolCall) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "tool": call.tool, "arguments": call.arguments }))
    }
}

/// Provider that always fails with a retryable server error.
pub struct BrokenProvider;

#[async_trait]
impl ModelProvider for BrokenProvider {
    async fn invoke(&self, _call: &ToolCall) -> Result<Value, ProviderError> {
        Err(ProviderError::Server {
            status: 500,
            message: "upstream down".to_string(),
        })
    }
}

/// Config with fast retries and a temp session path.
pub fn test_config(sessions: &TempDir) -> Config {
    let mut config = Config::default();
    config.session.path = sessions.path().to_path_buf();
    config.session.update_retries = 32;
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.jitter = false;
    config
}

/// Gateway backed by a temp session store, with an `echo` provider registered.
pub fn test_gateway() -> (Arc<Gateway>, Arc<EchoProvider>) {
    let tmp = Box::leak(Box::new(TempDir::new().unwrap()));
    let config = test_config(tmp);
    let store = Arc::new(FileSessionStore::new(tmp.path().to_path_buf()));
    let gateway = Arc::new(Gateway::new(&config, store));

    let provider = Arc::new(EchoProvider::new());
    gateway.providers().register("echo", provider.clone(), None);
    (gateway, provider)
}

/// Full router over a fresh gateway.
pub fn test_app() -> (Router, Arc<Gateway>) {
    let (gateway, _provider) = test_gateway();
    let app = server::build_app(
        AppState {
            gateway: gateway.clone(),
        },
        300,
    );
    (app, gateway)
}
