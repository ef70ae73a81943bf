//! Live HTTP dispatcher over `reqwest::Client`.
//!
//! Implements the engine's `HttpDispatch` port: executes a fully resolved
//! `RequestPlan`, classifies transport failures (timeout / network /
//! configuration), and normalizes the response into a `ResponseRecord`.
//! A completed exchange is always a response, whatever its status code.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use probeflow_core::request::{HttpDispatch, HttpError, RequestPlan};
use probeflow_types::execution::ResponseRecord;
use probeflow_types::scenario::HttpMethod;
use serde_json::Value;

/// Production [`HttpDispatch`] implementation.
///
/// Holds one `reqwest::Client` so the connection pool is shared across a
/// scenario's requests. Per-request deadlines come from the plan.
pub struct ReqwestDispatcher {
    client: reqwest::Client,
}

impl ReqwestDispatcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("probeflow/0.1")
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    /// Use an externally configured client (proxies, TLS settings, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, plan: RequestPlan) -> Result<ResponseRecord, HttpError> {
        let started = Instant::now();

        let mut builder = self
            .client
            .request(to_method(plan.method), &plan.url)
            .timeout(plan.timeout);
        for (key, value) in &plan.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &plan.body {
            builder = match body {
                // Pre-rendered text bodies go out verbatim; structured
                // bodies are serialized as JSON.
                Value::String(text) => builder.body(text.clone()),
                other => builder.json(other),
            };
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return Err(classify(err, started.elapsed())),
        };

        let status = response.status();
        let headers = normalize_headers(response.headers());
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => return Err(classify(err, started.elapsed())),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let data = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::debug!(
            url = plan.url.as_str(),
            status = status.as_u16(),
            duration_ms,
            "request completed"
        );

        Ok(ResponseRecord {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            data,
            duration_ms,
        })
    }
}

impl Default for ReqwestDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDispatch for ReqwestDispatcher {
    fn dispatch(
        &self,
        plan: RequestPlan,
    ) -> Pin<Box<dyn Future<Output = Result<ResponseRecord, HttpError>> + Send + '_>> {
        Box::pin(self.send(plan))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn classify(err: reqwest::Error, elapsed: Duration) -> HttpError {
    let duration_ms = elapsed.as_millis() as u64;
    if err.is_timeout() {
        HttpError::Timeout { duration_ms }
    } else if err.is_builder() {
        HttpError::Configuration {
            message: err.to_string(),
        }
    } else {
        HttpError::Network {
            message: err.to_string(),
            duration_ms,
        }
    }
}

/// Flatten a header map to string keys; multi-valued entries are joined
/// with `", "`. Non-UTF8 values are dropped.
fn normalize_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut normalized = HashMap::new();
    for key in headers.keys() {
        let joined = headers
            .get_all(key)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        normalized.insert(key.as_str().to_string(), joined);
    }
    normalized
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
