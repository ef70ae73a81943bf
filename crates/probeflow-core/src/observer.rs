//! Observation surface: synchronous callbacks delivered as execution
//! progresses.
//!
//! All callbacks run on the orchestrator task, in walk order. They must
//! return quickly and must not panic; the engine hands out references to
//! its own records, never mutable state.

use probeflow_types::execution::{
    ExecutionStatus, LogEntry, SerializedError, StepExecutionResult, StepStatus,
};

/// Receives execution callbacks. Every method defaults to a no-op so hosts
/// implement only what they consume.
pub trait ExecutionObserver: Send + Sync {
    /// A step entered execution (`running`) or parked (`waiting`).
    fn on_step_start(&self, _step_id: &str, _status: StepStatus) {}

    /// A step reached a terminal status; `result` is the recorded outcome.
    fn on_step_complete(&self, _step_id: &str, _result: &StepExecutionResult) {}

    /// A log entry was recorded.
    fn on_log(&self, _entry: &LogEntry) {}

    /// The execution failed terminally.
    fn on_error(&self, _error: &SerializedError, _step_id: Option<&str>) {}

    /// The overall status changed.
    fn on_status_change(&self, _status: ExecutionStatus) {}
}

/// Observer that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ExecutionObserver for NullObserver {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_null_observer_is_object_safe() {
        let observer: Arc<dyn ExecutionObserver> = Arc::new(NullObserver);
        observer.on_status_change(ExecutionStatus::Running);
        observer.on_step_start("s1", StepStatus::Running);
    }
}
