//! Shared domain types for the Probeflow scenario engine.
//!
//! This crate contains the canonical scenario representation consumed by the
//! execution engine: servers, the step graph (steps, branches, edges, loops),
//! condition expressions, and execution records (statuses, step results,
//! logs, serialized errors).
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono.

pub mod condition;
pub mod execution;
pub mod scenario;
pub mod server;
