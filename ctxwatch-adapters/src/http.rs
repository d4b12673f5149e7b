//! Bridge client for an instrumentation service speaking JSON over HTTP.
//!
//! ## Endpoints
//!
//! - `GET  /contexts` - list attached contexts
//! - `POST /contexts/{id}/select`
//! - `POST /contexts/{id}/evaluate` with body `{"expression": "..."}`
//! - `GET  /contexts/{id}/console` - drained console messages
//! - `GET  /contexts/{id}/network` - drained network activity
//! - `GET  /contexts/{id}/snapshot`
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ctxwatch_adapters::http::HttpBridge;
//! use ctxwatch_adapters::ProbeAdapter;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = HttpBridge::builder()
//!         .endpoint("http://localhost:9333")
//!         .build()?;
//!
//!     let adapter = ProbeAdapter::builder(Arc::new(bridge)).build();
//!     let contexts = adapter.discover(Duration::from_secs(1)).await?;
//!     println!("{} contexts attached", contexts.len());
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::{
    ConsoleEntry, ContextDescriptor, InstrumentationBridge, NetworkEntry, StructuralSnapshot,
};
use crate::BridgeError;

/// HTTP client implementing [`InstrumentationBridge`].
#[derive(Debug, Clone)]
pub struct HttpBridge {
    client: Client,
    endpoint: String,
}

impl HttpBridge {
    /// Create a new builder for configuring the bridge client.
    pub fn builder() -> HttpBridgeBuilder {
        HttpBridgeBuilder::default()
    }

    fn context_url(&self, context_id: &str, action: &str) -> String {
        format!(
            "{}/contexts/{}/{}",
            self.endpoint,
            urlencoded(context_id),
            action
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, context_id: Option<&str>) -> Result<T, BridgeError> {
        let response = self.client.get(url).send().await?;
        decode(check_status(response, context_id)?).await
    }
}

#[async_trait]
impl InstrumentationBridge for HttpBridge {
    async fn list_contexts(&self) -> Result<Vec<ContextDescriptor>, BridgeError> {
        let url = format!("{}/contexts", self.endpoint);
        self.get_json(&url, None).await
    }

    async fn select_context(&self, context_id: &str) -> Result<(), BridgeError> {
        let url = self.context_url(context_id, "select");
        let response = self.client.post(&url).send().await?;
        check_status(response, Some(context_id))?;
        Ok(())
    }

    async fn evaluate_in_context(
        &self,
        context_id: &str,
        expression: &str,
    ) -> Result<Value, BridgeError> {
        let url = self.context_url(context_id, "evaluate");
        let response = self
            .client
            .post(&url)
            .json(&EvaluateRequest { expression })
            .send()
            .await?;
        let reply: EvaluateResponse = decode(check_status(response, Some(context_id))?).await?;

        match reply.exception {
            Some(exception) => Err(BridgeError::Script(exception)),
            None => Ok(reply.result.unwrap_or(Value::Null)),
        }
    }

    async fn read_console_output(&self, context_id: &str) -> Result<Vec<ConsoleEntry>, BridgeError> {
        let url = self.context_url(context_id, "console");
        self.get_json(&url, Some(context_id)).await
    }

    async fn read_network_activity(&self, context_id: &str) -> Result<Vec<NetworkEntry>, BridgeError> {
        let url = self.context_url(context_id, "network");
        self.get_json(&url, Some(context_id)).await
    }

    async fn take_structural_snapshot(&self, context_id: &str) -> Result<StructuralSnapshot, BridgeError> {
        let url = self.context_url(context_id, "snapshot");
        self.get_json(&url, Some(context_id)).await
    }
}

/// Builder for HttpBridge.
#[derive(Debug, Default)]
pub struct HttpBridgeBuilder {
    endpoint: Option<String>,
    timeout: Option<Duration>,
}

impl HttpBridgeBuilder {
    /// Set the bridge service endpoint (default: "http://localhost:9333").
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the per-request timeout (default: 5 seconds).
    ///
    /// Probes carry their own, usually much shorter, deadline on top of this.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the bridge client.
    pub fn build(self) -> Result<HttpBridge, BridgeError> {
        let client = Client::builder()
            .timeout(self.timeout.unwrap_or(Duration::from_secs(5)))
            .build()
            .map_err(|e| BridgeError::Unavailable(e.to_string()))?;

        let endpoint = self
            .endpoint
            .unwrap_or_else(|| "http://localhost:9333".to_string());

        Ok(HttpBridge {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct EvaluateRequest<'a> {
    expression: &'a str,
}

#[derive(Debug, Deserialize)]
struct EvaluateResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    exception: Option<String>,
}

fn check_status(response: Response, context_id: Option<&str>) -> Result<Response, BridgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match (status, context_id) {
        (StatusCode::NOT_FOUND, Some(id)) => BridgeError::ContextGone(id.to_string()),
        (StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT, _) => BridgeError::Timeout,
        (StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY, _) => {
            BridgeError::Unavailable(format!("bridge returned status {status}"))
        }
        _ => BridgeError::Protocol(format!("bridge returned status {status}")),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BridgeError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

// Context ids come from the bridge and may contain path separators
fn urlencoded(s: &str) -> String {
    s.replace('%', "%25").replace('/', "%2F").replace(' ', "%20")
}
