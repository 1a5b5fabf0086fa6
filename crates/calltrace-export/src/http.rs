//! HTTP trace server backend
//!
//! Endpoints, relative to the configured base URL:
//! - `POST /calls/batch` with `{"events": [...]}`; the server may answer
//!   `{"accepted": n}` when it only stored the first `n` events
//! - `POST /ops` with `{"op_ref": "...", "op": {...}}`
//! - `GET /refs?uri=...` returning the stored object
//!
//! 4xx answers are rejections and are not retried; 5xx, 429 and transport failures are.

use async_trait::async_trait;
use calltrace_core::{
    BackendError, BackendResult, CallEnd, CallEvent, CallStart, CallUpdate, ObjectRef, OpDef,
    TraceBackend,
};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP backend configuration
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL of the trace server
    pub url: String,

    /// Request timeout
    pub timeout: Duration,

    /// Enable gzip compression
    pub compression: bool,

    /// Bearer token sent with every request
    pub bearer_token: Option<String>,

    /// Static headers to include in all requests
    pub headers: HashMap<String, String>,

    /// User-Agent header
    pub user_agent: String,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(10),
            compression: true,
            bearer_token: None,
            headers: HashMap::new(),
            user_agent: format!("calltrace/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpBackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    events: &'a [CallEvent],
}

#[derive(Debug, Default, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    accepted: Option<usize>,
}

#[derive(Serialize)]
struct SaveOpRequest<'a> {
    op_ref: &'a ObjectRef,
    op: &'a OpDef,
}

/// Sends call events to a trace server over HTTP
pub struct HttpBackend {
    config: HttpBackendConfig,
    client: Client,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> BackendResult<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent);

        if config.compression {
            builder = builder.gzip(true);
        }

        let client = builder
            .build()
            .map_err(|e| BackendError::Network(format!("Failed to create HTTP client: {}", e)))?;

        info!("HTTP backend initialized: url={}", config.url);
        Ok(Self {
            config,
            client,
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    /// Requests sent and requests failed
    pub fn request_counts(&self) -> (u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.config.url.trim_end_matches('/'), path);
        let mut request = self.client.request(method, url);

        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> BackendResult<Response> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let result = match request.send().await {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Err(BackendError::rejected(status, body))
            }
            Err(e) if e.is_timeout() => Err(BackendError::Timeout),
            Err(e) => Err(BackendError::Network(e.to_string())),
        };

        if let Err(e) = &result {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!("HTTP backend request failed: {}", e);
        }
        result
    }
}

// Empty bodies are fine; servers are not required to answer with JSON
async fn optional_json<T: for<'de> Deserialize<'de> + Default>(response: Response) -> T {
    match response.bytes().await {
        Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap_or_default(),
        _ => T::default(),
    }
}

#[async_trait]
impl TraceBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn call_start(&self, start: &CallStart) -> BackendResult<()> {
        self.upsert_batch(&[CallEvent::CallStart(start.clone())])
            .await
    }

    async fn call_end(&self, end: &CallEnd) -> BackendResult<()> {
        self.upsert_batch(&[CallEvent::CallEnd(end.clone())]).await
    }

    async fn call_update(&self, update: &CallUpdate) -> BackendResult<()> {
        self.upsert_batch(&[CallEvent::CallUpdate(update.clone())])
            .await
    }

    async fn save_op(&self, op_ref: &ObjectRef, op: &OpDef) -> BackendResult<()> {
        let request = self
            .request(Method::POST, "ops")
            .json(&SaveOpRequest { op_ref, op });
        self.send(request).await?;
        Ok(())
    }

    async fn resolve_ref(&self, object_ref: &ObjectRef) -> BackendResult<Value> {
        let uri = object_ref.uri();
        let request = self
            .request(Method::GET, "refs")
            .query(&[("uri", uri.as_str())]);

        match self.send(request).await {
            Ok(response) => response
                .json()
                .await
                .map_err(|e| BackendError::Network(format!("Invalid object body: {}", e))),
            Err(BackendError::Rejected { status: 404, .. }) => Err(BackendError::NotFound(uri)),
            Err(e) => Err(e),
        }
    }

    async fn upsert_batch(&self, events: &[CallEvent]) -> BackendResult<()> {
        let request = self
            .request(Method::POST, "calls/batch")
            .json(&BatchRequest { events });
        let response = self.send(request).await?;
        let answer: BatchResponse = optional_json(response).await;

        match answer.accepted {
            Some(accepted) if accepted < events.len() => Err(BackendError::Partial {
                sent: accepted,
                source: Box::new(BackendError::Network(format!(
                    "server accepted {} of {} events",
                    accepted,
                    events.len()
                ))),
            }),
            _ => {
                debug!("Posted batch of {} events", events.len());
                Ok(())
            }
        }
    }
}
