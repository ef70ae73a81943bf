//! Request planning and the dispatch boundary.
//!
//! The engine builds a fully resolved [`RequestPlan`] -- URL composition,
//! header merging, body resolution, timeout selection -- and hands it to an
//! implementation of [`HttpDispatch`]. The live client lives in
//! `probeflow-infra`; the split keeps this crate IO-free and lets tests run
//! against an in-memory dispatcher.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use probeflow_types::execution::{ResponseRecord, SerializedError};
use probeflow_types::scenario::{HttpMethod, RequestConfig};
use probeflow_types::server::{HeaderEntry, Server};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::resolver::{self, ResolveContext};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failures of the exchange itself. A completed exchange with an error
/// status is a [`ResponseRecord`], not an error; `Response` exists for
/// callers that opt in via [`ensure_success`].
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// The request exceeded its deadline.
    #[error("request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Connection or transport failure.
    #[error("network error after {duration_ms}ms: {message}")]
    Network { message: String, duration_ms: u64 },

    /// The request could not be built (bad URL, unknown server, bad header).
    #[error("request configuration error: {message}")]
    Configuration { message: String },

    /// A completed exchange whose status the caller chose to surface.
    #[error("server responded {status} {status_text}")]
    Response {
        status: u16,
        status_text: String,
        body: Value,
        duration_ms: u64,
    },
}

impl HttpError {
    /// Convert to the plain-data shape delivered across the observer
    /// boundary.
    pub fn to_serialized(&self) -> SerializedError {
        let mut serialized = SerializedError::new("HttpError", self.to_string());
        match self {
            HttpError::Timeout { .. } => {
                serialized.status_text = Some("Timeout".to_string());
            }
            HttpError::Response {
                status,
                status_text,
                body,
                ..
            } => {
                serialized.status = Some(*status);
                serialized.status_text = Some(status_text.clone());
                serialized.response = Some(body.clone());
            }
            HttpError::Network { .. } | HttpError::Configuration { .. } => {}
        }
        serialized
    }
}

/// Surface a non-2xx status as an error, for callers that opt in. The
/// engine itself records every completed exchange as a response.
pub fn ensure_success(response: &ResponseRecord) -> Result<(), HttpError> {
    if (200..300).contains(&response.status) {
        Ok(())
    } else {
        Err(HttpError::Response {
            status: response.status,
            status_text: response.status_text.clone(),
            body: response.data.clone(),
            duration_ms: response.duration_ms,
        })
    }
}

// ---------------------------------------------------------------------------
// RequestPlan
// ---------------------------------------------------------------------------

/// A fully resolved request, ready to put on the wire.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    /// Final URL, query parameters included.
    pub url: String,
    pub method: HttpMethod,
    /// Merged, resolved headers in application order.
    pub headers: Vec<(String, String)>,
    /// Resolved body. Absent for methods that do not send one.
    pub body: Option<Value>,
    pub timeout: Duration,
}

/// Dispatch boundary implemented by the live HTTP client.
pub trait HttpDispatch: Send + Sync {
    /// Execute the plan and normalize the outcome. Errors only when the
    /// exchange itself fails (timeout, network, configuration).
    fn dispatch(
        &self,
        plan: RequestPlan,
    ) -> Pin<Box<dyn Future<Output = Result<ResponseRecord, HttpError>> + Send + '_>>;
}

// ---------------------------------------------------------------------------
// Plan building
// ---------------------------------------------------------------------------

/// Build a fully resolved plan for a request step against a server.
pub fn build_plan(
    server: &Server,
    request: &RequestConfig,
    ctx: &ResolveContext<'_>,
) -> Result<RequestPlan, HttpError> {
    let joined = compose_url(&server.base_url, &request.endpoint);
    let resolved_url = resolver::substitute(&joined, ctx);
    let mut url = Url::parse(&resolved_url).map_err(|e| HttpError::Configuration {
        message: format!("invalid URL '{resolved_url}': {e}"),
    })?;

    if !request.query_params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &request.query_params {
            pairs.append_pair(key, &render_query_value(resolver::resolve(value, ctx)));
        }
    }

    let headers = merge_headers(&server.headers, &request.headers)
        .into_iter()
        .map(|(key, value)| (key, resolver::substitute(&value, ctx)))
        .collect();

    let body = if request.method.allows_body() {
        request.body.as_ref().map(|b| prepare_body(b, ctx))
    } else {
        None
    };

    Ok(RequestPlan {
        url: url.to_string(),
        method: request.method,
        headers,
        body,
        timeout: Duration::from_millis(request.timeout_ms.unwrap_or(server.timeout_ms)),
    })
}

/// Join base URL and endpoint with exactly one slash.
pub fn compose_url(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    format!("{base}/{endpoint}")
}

/// Merge server and step headers. Server headers come first; step headers
/// overwrite by key (case-insensitive, as on the wire). Only enabled entries
/// with a non-blank key participate.
pub fn merge_headers(
    server_headers: &[HeaderEntry],
    step_headers: &[HeaderEntry],
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for entry in server_headers.iter().chain(step_headers) {
        if !entry.enabled {
            continue;
        }
        let key = entry.key.trim();
        if key.is_empty() {
            continue;
        }
        match merged
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
        {
            Some((_, value)) => *value = entry.value.clone(),
            None => merged.push((key.to_string(), entry.value.clone())),
        }
    }
    merged
}

/// Resolve a request body. A JSON-syntactic string body is parsed first so
/// references inside it keep their types on the wire: `${params.count}`
/// inside `{"n": "${params.count}"}` becomes a real number.
pub fn prepare_body(body: &Value, ctx: &ResolveContext<'_>) -> Value {
    if let Value::String(text) = body {
        let trimmed = text.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(parsed) = serde_json::from_str::<Value>(text)
        {
            return resolver::resolve(&parsed, ctx);
        }
    }
    resolver::resolve(body, ctx)
}

fn render_query_value(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(&other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
