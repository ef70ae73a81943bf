//! Execution records: statuses, step results, loop frames, logs, and the
//! terminal execution snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a scenario execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Status of an individual step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    /// Parked on a manual pause, awaiting resume.
    Waiting,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// The request actually issued by a request step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A normalized HTTP response. Multi-valued headers are joined with `", "`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    /// Response body, parsed as JSON when possible, else the raw text.
    pub data: Value,
    pub duration_ms: u64,
}

/// Result of one step execution.
///
/// A request step carries exactly one of `response` or `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// Total iterations, for loop steps with a known count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// Zero-based index of the iteration in flight, for loop steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_iteration: Option<u32>,
}

impl StepExecutionResult {
    /// Create a bare result in the given status.
    pub fn new(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            started_at: None,
            completed_at: None,
            request: None,
            response: None,
            error: None,
            iterations: None,
            current_iteration: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop frames
// ---------------------------------------------------------------------------

/// One frame of the loop context stack. `${loop.item}` and `${loop.index}`
/// read the topmost frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopFrame {
    pub loop_id: String,
    pub loop_name: String,
    pub current_index: u32,
    /// Known up front for forEach/count loops; open-ended for while loops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_alias: Option<String>,
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// Severity of an engine log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log entry. Timestamps are non-decreasing across a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Serialized errors
// ---------------------------------------------------------------------------

/// Plain-data error shape, safe to hand across the observer boundary.
///
/// Engine errors are converted into this form before they reach step
/// results or callbacks; no live error objects cross the API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ErrorCause>,
}

impl SerializedError {
    /// Create an error with just a name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            status: None,
            status_text: None,
            response: None,
            cause: None,
        }
    }
}

/// Minimal wrapped-cause record inside a [`SerializedError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCause {
    pub name: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Terminal result
// ---------------------------------------------------------------------------

/// Terminal snapshot of a scenario execution, returned once the status is
/// completed, failed, or cancelled. No background work remains pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub scenario_id: String,
    pub status: ExecutionStatus,
    pub step_results: HashMap<String, StepExecutionResult>,
    /// Saved response bodies keyed by alias or step id.
    pub responses: HashMap<String, Value>,
    pub logs: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// The error that terminated the run, when status is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
