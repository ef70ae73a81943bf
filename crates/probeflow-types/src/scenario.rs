//! Scenario graph types: steps, branches, edges, and loop descriptors.
//!
//! `Scenario` is the canonical IR for an API-test flow: the visual editor,
//! import/export layer, and programmatic construction all converge on it.
//! The execution engine consumes it read-only.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::ConditionExpr;
use crate::server::HeaderEntry;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default ceiling on loop iterations when a loop does not set its own.
pub const DEFAULT_MAX_ITERATIONS: u32 = 1000;

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// A complete scenario: a directed graph of steps plus the servers and
/// parameters it runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: String,
    pub name: String,
    /// Semantic version string assigned by the editor.
    pub version: String,
    /// Servers this scenario references.
    #[serde(default)]
    pub server_ids: Vec<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Entry point of the walk.
    pub start_step_id: String,
    /// JSON schema describing expected parameters. Editor hint only; the
    /// engine does not enforce it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_schema: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Scenario {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The fall-through edge of a step: the first outgoing edge whose handle
    /// is absent or not branch-labeled. Branch-labeled edges (`branch_*`
    /// handles) belong to branch routing and are skipped.
    pub fn fall_through_edge(&self, step_id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| {
            e.source_step_id == step_id
                && e.source_handle
                    .as_deref()
                    .is_none_or(|h| !h.starts_with("branch_"))
        })
    }
}

/// A directed edge in the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source_step_id: String,
    pub target_step_id: String,
    /// Editor handle tag on the source side. Handles starting with
    /// `branch_` mark branch routing edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One node of the scenario graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Editor-assigned id, unique within a scenario.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Sleep before running, for `delayed` mode. Zero is allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Pre-condition: when present and false, the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpr>,
    /// Canvas position. UI hint only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Kind-specific payload.
    pub config: StepConfig,
}

impl Step {
    /// Short kind tag for logging.
    pub fn kind(&self) -> &'static str {
        match &self.config {
            StepConfig::Request(_) => "request",
            StepConfig::Condition { .. } => "condition",
            StepConfig::Loop { .. } => "loop",
            StepConfig::Group { .. } => "group",
        }
    }
}

/// When a step runs relative to the walk reaching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Execute immediately.
    #[default]
    Auto,
    /// Park until `resume()` is called.
    Manual,
    /// Sleep `delay_ms`, then execute.
    Delayed,
    /// Skip entirely.
    Bypass,
}

/// Canvas coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Kind-specific step payload, internally tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Issue an HTTP request.
    Request(RequestConfig),
    /// Route the walk through one of several branches.
    Condition { branches: Vec<Branch> },
    /// Repeat an ordered list of child steps.
    Loop {
        #[serde(rename = "loop")]
        descriptor: LoopKind,
        steps: Vec<String>,
    },
    /// Run an ordered list of child steps once.
    Group { steps: Vec<String> },
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Configuration of an HTTP request step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    pub server_id: String,
    pub method: HttpMethod,
    /// Endpoint path joined onto the server base URL with a single slash.
    pub endpoint: String,
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    /// Request body. A JSON-syntactic string is parsed before variable
    /// resolution so references inside it keep their types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub query_params: HashMap<String, Value>,
    /// When false the request is dispatched fire-and-forget and the walk
    /// advances without awaiting the response.
    #[serde(default = "default_true")]
    pub wait_for_response: bool,
    /// Store the response body under `response_alias` (or the step id).
    #[serde(default)]
    pub save_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_alias: Option<String>,
    /// Per-step timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Optional response branching, evaluated like a condition step.
    #[serde(default)]
    pub branches: Vec<Branch>,
    /// Declared retry policy. Carried for forward compatibility; not
    /// consulted during execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

fn default_true() -> bool {
    true
}

/// HTTP methods supported by request steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether a request body is sent for this method.
    pub fn allows_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry shape declared by the editor for request steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

/// A conditional successor from a condition or request step.
///
/// A branch with no condition and `is_default = true` is the fallback taken
/// when no other branch matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpr>,
    #[serde(default)]
    pub is_default: bool,
    pub next_step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// ---------------------------------------------------------------------------
// Loop descriptor
// ---------------------------------------------------------------------------

/// Loop descriptor, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopKind {
    /// Iterate over a list resolved from `source`.
    #[serde(rename_all = "camelCase")]
    ForEach {
        /// Path (or `${...}` reference) that must resolve to a list.
        source: String,
        item_alias: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index_alias: Option<String>,
        /// When set, each source item is repeated `item[count_field]` times.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count_field: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Repeat a fixed number of times. `count` may be a number or a
    /// resolvable string.
    #[serde(rename_all = "camelCase")]
    Count {
        count: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Repeat while a condition holds, re-evaluated after each iteration.
    #[serde(rename_all = "camelCase")]
    While {
        condition: ConditionExpr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
}

impl LoopKind {
    /// The effective iteration ceiling for this loop.
    pub fn iteration_ceiling(&self) -> u32 {
        let configured = match self {
            LoopKind::ForEach { max_iterations, .. }
            | LoopKind::Count { max_iterations, .. }
            | LoopKind::While { max_iterations, .. } => *max_iterations,
        };
        configured.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
