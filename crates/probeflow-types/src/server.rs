//! Remote server targets for scenario request steps.

use serde::{Deserialize, Serialize};

/// Default request timeout when neither the step nor the server sets one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// A remote server that request steps execute against.
///
/// Servers are constructed externally and passed to the engine read-only,
/// keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub name: String,
    /// Base URL, e.g. `https://api.example.com`. Trailing slashes are
    /// stripped when the endpoint is joined on.
    pub base_url: String,
    /// Default headers applied to every request against this server.
    /// Step headers overwrite these by key.
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    /// Default request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// One header row as edited in the flow editor. Disabled rows are kept in
/// the model but never sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl HeaderEntry {
    /// Create an enabled header entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
