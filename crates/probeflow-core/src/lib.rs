//! Scenario execution engine for Probeflow.
//!
//! The engine walks a scenario's step graph against configured servers:
//! - `resolver` -- `${...}` expansion over params, responses, and loop state
//! - `condition` -- single conditions and AND/OR groups
//! - `looping` -- per-iteration contexts for forEach / count / while loops
//! - `request` -- request planning and the `HttpDispatch` boundary
//! - `control` -- pause / resume / stop handle
//! - `observer` -- synchronous execution callbacks
//! - `validate` -- upfront structural validation
//! - `orchestrator` -- the walk state machine
//!
//! The engine is headless and IO-free: the live HTTP client lives in
//! `probeflow-infra`, behind the `HttpDispatch` trait.

pub mod condition;
pub mod control;
pub mod looping;
pub mod observer;
pub mod orchestrator;
pub mod request;
pub mod resolver;
pub mod validate;

pub use control::ExecutionControl;
pub use observer::{ExecutionObserver, NullObserver};
pub use orchestrator::{ExecuteOptions, ExecutorError, ScenarioRunner};
pub use request::{HttpDispatch, HttpError, RequestPlan};
