//! Scenario orchestrator: walks the step graph, honors execution modes,
//! manages pause/resume/cancel, nests loops, and emits callbacks.
//!
//! The walk is single-threaded and cooperative: it suspends only at delays,
//! manual pauses, and awaited requests. Fire-and-forget requests run as
//! detached tasks in a `tokio::JoinSet` owned by the execution; they are
//! drained (their saves applied) or aborted before the terminal result is
//! returned, so no background task outlives `execute()`.
//!
//! # Walk rules
//!
//! After each step the successor is computed: condition steps (and request
//! steps with branches) route through branch evaluation; everything else
//! takes the fall-through edge. A missing fall-through edge ends the walk.
//! Inside a loop or group body, a successor outside the body runs once for
//! its effects and ends the iteration -- its own successor is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use probeflow_types::execution::{
    ExecutionResult, ExecutionStatus, LogEntry, LogLevel, LoopFrame, RequestRecord,
    SerializedError, StepExecutionResult, StepStatus,
};
use probeflow_types::scenario::{
    Branch, ExecutionMode, LoopKind, RequestConfig, Scenario, Step, StepConfig,
};
use probeflow_types::server::Server;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::condition::{self, ConditionError};
use crate::control::ExecutionControl;
use crate::looping::{LoopError, LoopIterator};
use crate::observer::{ExecutionObserver, NullObserver};
use crate::request::{self, HttpDispatch, HttpError};
use crate::resolver::{ResolveContext, ResolveError};
use crate::validate::{validate_scenario, ScenarioError};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-execution options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Terminate with status `failed` on the first propagated error
    /// (default). When false the walk continues on the fall-through edge.
    pub stop_on_error: bool,
    /// Per-step execution mode overrides, keyed by step id.
    pub step_mode_overrides: HashMap<String, ExecutionMode>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            step_mode_overrides: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that propagate through the walk.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("scenario validation failed: {0}")]
    Invalid(#[from] ScenarioError),

    /// Execution was stopped via the control handle.
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Convert to the plain-data shape recorded on step results and handed
    /// to `on_error`.
    pub fn to_serialized(&self) -> SerializedError {
        match self {
            ExecutorError::Http(err) => err.to_serialized(),
            ExecutorError::Resolve(err) => SerializedError::new("ResolveError", err.to_string()),
            ExecutorError::Condition(ConditionError::Resolve(cause)) => SerializedError {
                cause: Some(probeflow_types::execution::ErrorCause {
                    name: "ResolveError".to_string(),
                    message: cause.to_string(),
                }),
                ..SerializedError::new("ConditionError", self.to_string())
            },
            ExecutorError::Condition(err) => {
                SerializedError::new("ConditionError", err.to_string())
            }
            ExecutorError::Loop(LoopError::LimitExceeded { .. }) => {
                SerializedError::new("LoopLimitExceeded", self.to_string())
            }
            ExecutorError::Loop(LoopError::Resolve(err)) => {
                SerializedError::new("ResolveError", err.to_string())
            }
            ExecutorError::Invalid(err) => SerializedError::new("ValidationError", err.to_string()),
            ExecutorError::Cancelled => SerializedError::new("Cancelled", self.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Outcome of a detached fire-and-forget request.
struct BackgroundOutcome {
    step_id: String,
    save_key: Option<String>,
    result: Result<probeflow_types::execution::ResponseRecord, HttpError>,
}

/// Mutable state owned by one execution. External observers only ever see
/// snapshots through callbacks and the terminal result.
struct ExecState {
    execution_id: Uuid,
    status: ExecutionStatus,
    step_results: HashMap<String, StepExecutionResult>,
    responses: HashMap<String, Value>,
    logs: Vec<LogEntry>,
    loop_stack: Vec<LoopFrame>,
    background: JoinSet<BackgroundOutcome>,
    params: Value,
    started_at: DateTime<Utc>,
    last_timestamp: DateTime<Utc>,
    failed_step: Option<String>,
    error: Option<SerializedError>,
}

impl ExecState {
    fn new(params: Value) -> Self {
        let started_at = Utc::now();
        Self {
            execution_id: Uuid::now_v7(),
            status: ExecutionStatus::Pending,
            step_results: HashMap::new(),
            responses: HashMap::new(),
            logs: Vec::new(),
            loop_stack: Vec::new(),
            background: JoinSet::new(),
            params,
            started_at,
            last_timestamp: started_at,
            failed_step: None,
            error: None,
        }
    }

    /// Clamped clock: log and record timestamps never decrease, even if the
    /// system clock steps backwards.
    fn now(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        if now > self.last_timestamp {
            self.last_timestamp = now;
        }
        self.last_timestamp
    }
}

fn resolve_ctx(state: &ExecState) -> ResolveContext<'_> {
    ResolveContext {
        params: &state.params,
        responses: &state.responses,
        loop_stack: &state.loop_stack,
        timestamp: state.started_at,
    }
}

// ---------------------------------------------------------------------------
// ScenarioRunner
// ---------------------------------------------------------------------------

/// Drives a single scenario execution against a set of servers.
///
/// The runner owns the scenario and server map read-only, dispatches
/// requests through an [`HttpDispatch`] implementation, and reports progress
/// through an [`ExecutionObserver`]. The [`ExecutionControl`] handle is
/// available before `execute()` is called and stays valid throughout.
pub struct ScenarioRunner {
    scenario: Scenario,
    servers: HashMap<String, Server>,
    dispatcher: Arc<dyn HttpDispatch>,
    observer: Arc<dyn ExecutionObserver>,
    options: ExecuteOptions,
    control: ExecutionControl,
}

impl ScenarioRunner {
    pub fn new(
        scenario: Scenario,
        servers: HashMap<String, Server>,
        dispatcher: Arc<dyn HttpDispatch>,
    ) -> Self {
        Self {
            scenario,
            servers,
            dispatcher,
            observer: Arc::new(NullObserver),
            options: ExecuteOptions::default(),
            control: ExecutionControl::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    /// The control handle for this execution.
    pub fn control(&self) -> ExecutionControl {
        self.control.clone()
    }

    /// Execute the scenario to a terminal result.
    ///
    /// All failures are encoded in the result: a structural violation or a
    /// propagated step error yields status `failed`, a stop yields
    /// `cancelled`. By the time this returns, every fire-and-forget task has
    /// completed or been aborted.
    pub async fn execute(&self, params: Value) -> ExecutionResult {
        let mut state = ExecState::new(params);
        self.set_status(&mut state, ExecutionStatus::Running);
        self.log(
            &mut state,
            LogLevel::Info,
            format!("scenario '{}' started", self.scenario.name),
            None,
            None,
        );
        tracing::info!(
            scenario_id = self.scenario.id.as_str(),
            execution_id = %state.execution_id,
            "starting scenario execution"
        );

        if let Err(err) = validate_scenario(&self.scenario, &self.servers) {
            let err = ExecutorError::from(err);
            self.log(
                &mut state,
                LogLevel::Error,
                err.to_string(),
                None,
                None,
            );
            state.error = Some(err.to_serialized());
            return self.finish(state, ExecutionStatus::Failed).await;
        }

        let status = self.walk(&mut state).await;
        self.finish(state, status).await
    }

    // -----------------------------------------------------------------------
    // Walk
    // -----------------------------------------------------------------------

    async fn walk(&self, state: &mut ExecState) -> ExecutionStatus {
        let mut current = self.scenario.start_step_id.clone();
        loop {
            self.drain_background(state);
            if self.control.is_stopped() {
                return ExecutionStatus::Cancelled;
            }
            if !self.pause_gate(state).await {
                return ExecutionStatus::Cancelled;
            }

            let Some(step) = self.scenario.step(&current) else {
                self.log(
                    state,
                    LogLevel::Warn,
                    format!("step '{current}' not found, stopping walk"),
                    Some(current.clone()),
                    None,
                );
                return ExecutionStatus::Completed;
            };

            match self.run_step(state, step).await {
                Ok(Some(next)) => current = next,
                Ok(None) => return ExecutionStatus::Completed,
                Err(ExecutorError::Cancelled) => return ExecutionStatus::Cancelled,
                Err(err) => {
                    if self.options.stop_on_error {
                        state.failed_step = Some(step.id.clone());
                        state.error = Some(err.to_serialized());
                        return ExecutionStatus::Failed;
                    }
                    self.log(
                        state,
                        LogLevel::Info,
                        format!("continuing after failure in step '{}'", step.id),
                        Some(step.id.clone()),
                        None,
                    );
                    match self.fall_through(&step.id) {
                        Some(next) => current = next,
                        None => return ExecutionStatus::Completed,
                    }
                }
            }
        }
    }

    /// Honor a host-initiated pause at a step boundary. Returns false when
    /// stopped while parked.
    async fn pause_gate(&self, state: &mut ExecState) -> bool {
        if !self.control.is_paused() {
            return true;
        }
        self.set_status(state, ExecutionStatus::Paused);
        self.log(state, LogLevel::Info, "execution paused", None, None);
        if self.control.wait_until_resumed().await {
            self.set_status(state, ExecutionStatus::Running);
            self.log(state, LogLevel::Info, "execution resumed", None, None);
            true
        } else {
            false
        }
    }

    /// Execute one step and compute its successor. Boxed because loop and
    /// group bodies recurse through it.
    fn run_step<'a>(
        &'a self,
        state: &'a mut ExecState,
        step: &'a Step,
    ) -> BoxFuture<'a, Result<Option<String>, ExecutorError>> {
        Box::pin(async move {
            // Pre-condition gate: false skips the step entirely.
            if let Some(expr) = &step.condition {
                let outcome = {
                    let ctx = resolve_ctx(state);
                    condition::evaluate(expr, &ctx)
                };
                match outcome {
                    Ok(true) => {}
                    Ok(false) => {
                        self.record_skip(state, step, "pre-condition evaluated false");
                        return Ok(self.fall_through(&step.id));
                    }
                    Err(err) => {
                        let err = ExecutorError::from(err);
                        self.record_failure(state, &step.id, &err);
                        return Err(err);
                    }
                }
            }

            let mode = self
                .options
                .step_mode_overrides
                .get(&step.id)
                .copied()
                .unwrap_or(step.execution_mode);

            match mode {
                ExecutionMode::Bypass => {
                    self.record_skip(state, step, "bypassed");
                    return Ok(self.fall_through(&step.id));
                }
                ExecutionMode::Delayed => {
                    let delay = Duration::from_millis(step.delay_ms.unwrap_or(0));
                    self.park_step(state, step);
                    self.log(
                        state,
                        LogLevel::Info,
                        format!("step '{}' delayed for {}ms", step.name, delay.as_millis()),
                        Some(step.id.clone()),
                        None,
                    );
                    if !self.control.sleep_unless_stopped(delay).await {
                        self.mark_cancelled(state, &step.id);
                        return Err(ExecutorError::Cancelled);
                    }
                }
                ExecutionMode::Manual => {
                    self.park_step(state, step);
                    self.log(
                        state,
                        LogLevel::Info,
                        format!("step '{}' waiting for resume", step.name),
                        Some(step.id.clone()),
                        None,
                    );
                    self.control.pause();
                    self.set_status(state, ExecutionStatus::Paused);
                    if !self.control.wait_until_resumed().await {
                        self.mark_cancelled(state, &step.id);
                        return Err(ExecutorError::Cancelled);
                    }
                    self.set_status(state, ExecutionStatus::Running);
                    self.log(
                        state,
                        LogLevel::Info,
                        format!("step '{}' resumed", step.name),
                        Some(step.id.clone()),
                        None,
                    );
                }
                ExecutionMode::Auto => {}
            }

            match &step.config {
                StepConfig::Request(config) => self.run_request(state, step, config).await,
                StepConfig::Condition { branches } => self.run_condition(state, step, branches),
                StepConfig::Loop { descriptor, steps } => {
                    self.run_loop(state, step, descriptor, steps).await
                }
                StepConfig::Group { steps } => self.run_group(state, step, steps).await,
            }
        })
    }

    /// Walk a loop or group body starting from its first child. A successor
    /// outside the body runs once for its effects (including manual pauses
    /// and branch navigation) and ends the iteration; its own successor is
    /// ignored.
    async fn walk_body(
        &self,
        state: &mut ExecState,
        body: &[String],
    ) -> Result<(), ExecutorError> {
        let Some(first) = body.first() else {
            return Ok(());
        };
        let body_set: HashSet<&str> = body.iter().map(String::as_str).collect();
        let mut current = first.clone();
        loop {
            self.drain_background(state);
            if self.control.is_stopped() {
                return Err(ExecutorError::Cancelled);
            }
            if !self.pause_gate(state).await {
                return Err(ExecutorError::Cancelled);
            }

            let Some(step) = self.scenario.step(&current) else {
                self.log(
                    state,
                    LogLevel::Warn,
                    format!("step '{current}' not found, ending iteration"),
                    Some(current.clone()),
                    None,
                );
                return Ok(());
            };

            match self.run_step(state, step).await? {
                None => return Ok(()),
                Some(next) if body_set.contains(next.as_str()) => current = next,
                Some(next) => {
                    // Branch target escapes the body: run it once, then end
                    // the iteration.
                    if let Some(escape) = self.scenario.step(&next) {
                        self.log(
                            state,
                            LogLevel::Info,
                            format!("branch escapes the body into step '{}'", escape.name),
                            Some(next.clone()),
                            None,
                        );
                        self.run_step(state, escape).await?;
                    } else {
                        self.log(
                            state,
                            LogLevel::Warn,
                            format!("step '{next}' not found"),
                            Some(next.clone()),
                            None,
                        );
                    }
                    return Ok(());
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Step kinds
    // -----------------------------------------------------------------------

    async fn run_request(
        &self,
        state: &mut ExecState,
        step: &Step,
        config: &RequestConfig,
    ) -> Result<Option<String>, ExecutorError> {
        self.begin_step(state, step);
        match self.try_request(state, step, config).await {
            Ok(successor) => Ok(successor),
            Err(err) => {
                self.record_failure(state, &step.id, &err);
                Err(err)
            }
        }
    }

    async fn try_request(
        &self,
        state: &mut ExecState,
        step: &Step,
        config: &RequestConfig,
    ) -> Result<Option<String>, ExecutorError> {
        let server =
            self.servers
                .get(&config.server_id)
                .ok_or_else(|| HttpError::Configuration {
                    message: format!("unknown server '{}'", config.server_id),
                })?;
        let plan = {
            let ctx = resolve_ctx(state);
            request::build_plan(server, config, &ctx)?
        };

        let record = RequestRecord {
            url: plan.url.clone(),
            method: plan.method.to_string(),
            headers: plan.headers.iter().cloned().collect(),
            body: plan.body.clone(),
        };
        if let Some(result) = state.step_results.get_mut(&step.id) {
            result.request = Some(record);
        }

        let save_key = config
            .save_response
            .then(|| config.response_alias.clone().unwrap_or_else(|| step.id.clone()));

        if config.wait_for_response {
            self.log(
                state,
                LogLevel::Info,
                format!("{} {}", plan.method, plan.url),
                Some(step.id.clone()),
                None,
            );
            let response = self.dispatcher.dispatch(plan).await?;
            self.log(
                state,
                LogLevel::Info,
                format!(
                    "response {} {} in {}ms",
                    response.status, response.status_text, response.duration_ms
                ),
                Some(step.id.clone()),
                Some(json!({ "status": response.status, "durationMs": response.duration_ms })),
            );
            if let Some(key) = save_key {
                state.responses.insert(key, response.data.clone());
            }
            if let Some(result) = state.step_results.get_mut(&step.id) {
                result.response = Some(response);
            }
            self.complete_step(state, &step.id, StepStatus::Success);
            if !config.branches.is_empty() {
                return self.evaluate_branches(state, &step.id, &config.branches);
            }
            Ok(self.fall_through(&step.id))
        } else {
            // Fire-and-forget: dispatch as a detached task, record the
            // request, and advance immediately. The outcome is applied by
            // the orchestrator when the task joins.
            self.log(
                state,
                LogLevel::Info,
                format!("{} {} dispatched without waiting", plan.method, plan.url),
                Some(step.id.clone()),
                None,
            );
            let dispatcher = Arc::clone(&self.dispatcher);
            let step_id = step.id.clone();
            state.background.spawn(async move {
                let result = dispatcher.dispatch(plan).await;
                BackgroundOutcome {
                    step_id,
                    save_key,
                    result,
                }
            });
            self.complete_step(state, &step.id, StepStatus::Success);
            Ok(self.fall_through(&step.id))
        }
    }

    fn run_condition(
        &self,
        state: &mut ExecState,
        step: &Step,
        branches: &[Branch],
    ) -> Result<Option<String>, ExecutorError> {
        self.begin_step(state, step);
        match self.evaluate_branches(state, &step.id, branches) {
            Ok(successor) => {
                self.complete_step(state, &step.id, StepStatus::Success);
                Ok(successor)
            }
            Err(err) => {
                self.record_failure(state, &step.id, &err);
                Err(err)
            }
        }
    }

    async fn run_loop(
        &self,
        state: &mut ExecState,
        step: &Step,
        descriptor: &LoopKind,
        body: &[String],
    ) -> Result<Option<String>, ExecutorError> {
        self.begin_step(state, step);
        match self.try_loop(state, step, descriptor, body).await {
            Ok(iterations) => {
                if let Some(result) = state.step_results.get_mut(&step.id) {
                    result.iterations = Some(iterations);
                }
                self.log(
                    state,
                    LogLevel::Info,
                    format!("loop '{}' finished after {iterations} iteration(s)", step.name),
                    Some(step.id.clone()),
                    None,
                );
                self.complete_step(state, &step.id, StepStatus::Success);
                Ok(self.fall_through(&step.id))
            }
            Err(ExecutorError::Cancelled) => {
                self.mark_cancelled(state, &step.id);
                Err(ExecutorError::Cancelled)
            }
            Err(err) => {
                self.record_failure(state, &step.id, &err);
                Err(err)
            }
        }
    }

    async fn try_loop(
        &self,
        state: &mut ExecState,
        step: &Step,
        descriptor: &LoopKind,
        body: &[String],
    ) -> Result<u32, ExecutorError> {
        // While conditions are evaluated here; an evaluation failure exits
        // the loop cleanly instead of raising.
        let initial = match descriptor {
            LoopKind::While { condition, .. } => {
                let ctx = resolve_ctx(state);
                condition::evaluate(condition, &ctx).unwrap_or(false)
            }
            _ => false,
        };
        let mut iterator = {
            let ctx = resolve_ctx(state);
            LoopIterator::new(&step.id, &step.name, descriptor, &ctx, initial)?
        };
        if let Some(total) = iterator.total_iterations()
            && let Some(result) = state.step_results.get_mut(&step.id)
        {
            result.iterations = Some(total);
        }

        let mut completed = 0u32;
        loop {
            if self.control.is_stopped() {
                return Err(ExecutorError::Cancelled);
            }
            let Some(frame) = iterator.next_frame()? else {
                break;
            };
            let index = frame.current_index;
            if let Some(result) = state.step_results.get_mut(&step.id) {
                result.current_iteration = Some(index);
            }
            self.log(
                state,
                LogLevel::Info,
                format!("loop '{}' iteration {} started", step.name, index + 1),
                Some(step.id.clone()),
                None,
            );

            state.loop_stack.push(frame);
            let walked = self.walk_body(state, body).await;
            state.loop_stack.pop();
            walked?;

            self.log(
                state,
                LogLevel::Debug,
                format!("loop '{}' iteration {} finished", step.name, index + 1),
                Some(step.id.clone()),
                None,
            );
            completed += 1;

            if let LoopKind::While { condition, .. } = descriptor {
                let holds = {
                    let ctx = resolve_ctx(state);
                    condition::evaluate(condition, &ctx).unwrap_or(false)
                };
                iterator.update_condition(holds);
            }
        }
        Ok(completed)
    }

    async fn run_group(
        &self,
        state: &mut ExecState,
        step: &Step,
        body: &[String],
    ) -> Result<Option<String>, ExecutorError> {
        self.begin_step(state, step);
        match self.walk_body(state, body).await {
            Ok(()) => {
                self.complete_step(state, &step.id, StepStatus::Success);
                Ok(self.fall_through(&step.id))
            }
            Err(ExecutorError::Cancelled) => {
                self.mark_cancelled(state, &step.id);
                Err(ExecutorError::Cancelled)
            }
            Err(err) => {
                self.record_failure(state, &step.id, &err);
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Branch evaluation
    // -----------------------------------------------------------------------

    /// First matching non-default branch wins; otherwise the first default
    /// branch; otherwise no successor (logged as a warning).
    fn evaluate_branches(
        &self,
        state: &mut ExecState,
        step_id: &str,
        branches: &[Branch],
    ) -> Result<Option<String>, ExecutorError> {
        for branch in branches.iter().filter(|b| !b.is_default) {
            let matched = match &branch.condition {
                Some(expr) => {
                    let ctx = resolve_ctx(state);
                    condition::evaluate(expr, &ctx)?
                }
                None => true,
            };
            if matched {
                self.log(
                    state,
                    LogLevel::Info,
                    format!(
                        "branch '{}' taken",
                        branch.label.as_deref().unwrap_or(&branch.id)
                    ),
                    Some(step_id.to_string()),
                    Some(json!({ "nextStepId": branch.next_step_id })),
                );
                return Ok(Some(branch.next_step_id.clone()));
            }
        }
        if let Some(default) = branches.iter().find(|b| b.is_default) {
            self.log(
                state,
                LogLevel::Info,
                "default branch taken",
                Some(step_id.to_string()),
                Some(json!({ "nextStepId": default.next_step_id })),
            );
            return Ok(Some(default.next_step_id.clone()));
        }
        self.log(
            state,
            LogLevel::Warn,
            "no branch matched and no default branch is set",
            Some(step_id.to_string()),
            None,
        );
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Apply any finished fire-and-forget outcomes without blocking.
    fn drain_background(&self, state: &mut ExecState) {
        loop {
            match state.background.try_join_next() {
                Some(Ok(outcome)) => self.apply_background(state, outcome),
                Some(Err(_)) => {}
                None => break,
            }
        }
    }

    fn apply_background(&self, state: &mut ExecState, outcome: BackgroundOutcome) {
        match outcome.result {
            Ok(response) => {
                if let Some(key) = outcome.save_key {
                    state.responses.insert(key, response.data.clone());
                }
                self.log(
                    state,
                    LogLevel::Info,
                    format!(
                        "background response {} in {}ms",
                        response.status, response.duration_ms
                    ),
                    Some(outcome.step_id),
                    Some(json!({ "status": response.status })),
                );
            }
            Err(err) => {
                self.log(
                    state,
                    LogLevel::Warn,
                    format!("background request failed: {err}"),
                    Some(outcome.step_id),
                    None,
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    async fn finish(&self, mut state: ExecState, status: ExecutionStatus) -> ExecutionResult {
        // No background task may outlive the execution: drain their saves on
        // a normal end, abort them on cancellation.
        if status == ExecutionStatus::Cancelled {
            state.background.shutdown().await;
        } else {
            loop {
                match state.background.join_next().await {
                    Some(Ok(outcome)) => self.apply_background(&mut state, outcome),
                    Some(Err(_)) => {}
                    None => break,
                }
            }
        }

        self.set_status(&mut state, status);
        let (level, message) = match status {
            ExecutionStatus::Completed => (
                LogLevel::Info,
                format!("scenario '{}' completed", self.scenario.name),
            ),
            ExecutionStatus::Failed => (
                LogLevel::Error,
                format!("scenario '{}' failed", self.scenario.name),
            ),
            ExecutionStatus::Cancelled => (
                LogLevel::Info,
                format!("scenario '{}' cancelled", self.scenario.name),
            ),
            other => (
                LogLevel::Warn,
                format!("scenario '{}' ended with status {other:?}", self.scenario.name),
            ),
        };
        self.log(&mut state, level, message, None, None);

        if status == ExecutionStatus::Failed
            && let Some(error) = state.error.clone()
        {
            self.observer.on_error(&error, state.failed_step.as_deref());
        }

        let completed_at = state.now();
        tracing::info!(
            execution_id = %state.execution_id,
            status = ?status,
            steps = state.step_results.len(),
            "scenario execution finished"
        );

        ExecutionResult {
            execution_id: state.execution_id,
            scenario_id: self.scenario.id.clone(),
            status,
            step_results: state.step_results,
            responses: state.responses,
            logs: state.logs,
            started_at: state.started_at,
            completed_at,
            error: state.error,
        }
    }

    // -----------------------------------------------------------------------
    // Records, logs, callbacks
    // -----------------------------------------------------------------------

    fn fall_through(&self, step_id: &str) -> Option<String> {
        self.scenario
            .fall_through_edge(step_id)
            .map(|edge| edge.target_step_id.clone())
    }

    fn begin_step(&self, state: &mut ExecState, step: &Step) {
        let now = state.now();
        let mut result = StepExecutionResult::new(&step.id, StepStatus::Running);
        result.started_at = Some(now);
        state.step_results.insert(step.id.clone(), result);
        self.observer.on_step_start(&step.id, StepStatus::Running);
        self.log(
            state,
            LogLevel::Info,
            format!("step '{}' started", step.name),
            Some(step.id.clone()),
            Some(json!({ "kind": step.kind() })),
        );
    }

    /// Record a step as parked (`waiting`) ahead of a delay or manual pause.
    fn park_step(&self, state: &mut ExecState, step: &Step) {
        let now = state.now();
        let mut result = StepExecutionResult::new(&step.id, StepStatus::Waiting);
        result.started_at = Some(now);
        state.step_results.insert(step.id.clone(), result);
        self.observer.on_step_start(&step.id, StepStatus::Waiting);
    }

    fn complete_step(&self, state: &mut ExecState, step_id: &str, status: StepStatus) {
        let now = state.now();
        if let Some(result) = state.step_results.get_mut(step_id) {
            result.status = status;
            result.completed_at = Some(now);
        }
        if let Some(result) = state.step_results.get(step_id) {
            self.observer.on_step_complete(step_id, result);
        }
    }

    fn record_skip(&self, state: &mut ExecState, step: &Step, reason: &str) {
        let now = state.now();
        let mut result = StepExecutionResult::new(&step.id, StepStatus::Skipped);
        result.started_at = Some(now);
        result.completed_at = Some(now);
        state.step_results.insert(step.id.clone(), result);
        self.log(
            state,
            LogLevel::Info,
            format!("step '{}' skipped ({reason})", step.name),
            Some(step.id.clone()),
            None,
        );
        if let Some(result) = state.step_results.get(&step.id) {
            self.observer.on_step_complete(&step.id, result);
        }
    }

    fn record_failure(&self, state: &mut ExecState, step_id: &str, err: &ExecutorError) {
        let now = state.now();
        let entry = state
            .step_results
            .entry(step_id.to_string())
            .or_insert_with(|| StepExecutionResult::new(step_id, StepStatus::Failed));
        entry.status = StepStatus::Failed;
        entry.completed_at = Some(now);
        entry.response = None;
        entry.error = Some(err.to_serialized());
        self.log(
            state,
            LogLevel::Error,
            format!("step '{step_id}' failed: {err}"),
            Some(step_id.to_string()),
            None,
        );
        if let Some(result) = state.step_results.get(step_id) {
            self.observer.on_step_complete(step_id, result);
        }
    }

    fn mark_cancelled(&self, state: &mut ExecState, step_id: &str) {
        let now = state.now();
        if let Some(result) = state.step_results.get_mut(step_id) {
            result.status = StepStatus::Cancelled;
            result.completed_at = Some(now);
        }
        self.log(
            state,
            LogLevel::Info,
            format!("step '{step_id}' cancelled"),
            Some(step_id.to_string()),
            None,
        );
    }

    fn set_status(&self, state: &mut ExecState, status: ExecutionStatus) {
        if state.status != status {
            state.status = status;
            self.observer.on_status_change(status);
        }
    }

    fn log(
        &self,
        state: &mut ExecState,
        level: LogLevel,
        message: impl Into<String>,
        step_id: Option<String>,
        data: Option<Value>,
    ) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(step_id = step_id.as_deref(), "{message}"),
            LogLevel::Info => tracing::info!(step_id = step_id.as_deref(), "{message}"),
            LogLevel::Warn => tracing::warn!(step_id = step_id.as_deref(), "{message}"),
            LogLevel::Error => tracing::error!(step_id = step_id.as_deref(), "{message}"),
        }
        let entry = LogEntry {
            id: Uuid::now_v7(),
            timestamp: state.now(),
            level,
            message,
            step_id,
            data,
        };
        state.logs.push(entry);
        if let Some(entry) = state.logs.last() {
            self.observer.on_log(entry);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
