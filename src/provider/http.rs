//! Generic JSON-over-HTTP tool provider.
//!
//! Posts the tool call as a JSON document to the provider's base URL and
//! returns the response body as JSON. Provider-specific request shaping lives
//! behind the upstream endpoint, not here; this client only classifies
//! outcomes into the gateway's error taxonomy.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::error::ProviderError;
use super::{ModelProvider, ToolCall};

pub struct HttpToolProvider {
    name: String,
    base_url: String,
    client: Client,
}

impl HttpToolProvider {
    pub fn new(name: &str, base_url: &str, client: Client) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl ModelProvider for HttpToolProvider {
    async fn invoke(&self, call: &ToolCall) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/tools/{}", self.base_url, call.tool))
            .json(&json!({
                "provider": self.name,
                "session_id": call.session_id,
                "arguments": call.arguments,
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let retry_after_ms = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let message = response.text().await.unwrap_or_default();

        Err(match status.as_u16() {
            429 => ProviderError::RateLimited { retry_after_ms },
            code if status.is_server_error() => ProviderError::Server {
                status: code,
                message,
            },
            code => ProviderError::Client {
                status: code,
                message,
            },
        })
    }
}
