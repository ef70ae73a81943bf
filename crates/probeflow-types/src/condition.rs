//! Condition expressions evaluated against parameters and stored responses.
//!
//! A condition is either a single comparison or an AND/OR group of nested
//! expressions. Groups may nest to any depth; an empty group is true.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single condition or a nested AND/OR group.
///
/// Untagged on the wire: an object carrying `operator: "AND"|"OR"` plus
/// `conditions` is a group, anything with `source`/`field` is a single
/// comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionExpr {
    Group(ConditionGroup),
    Single(Condition),
}

/// AND/OR over nested condition expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: GroupOperator,
    #[serde(default)]
    pub conditions: Vec<ConditionExpr>,
}

/// Boolean connective for a condition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOperator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// Where a condition reads its left-hand value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSource {
    Params,
    Response,
}

/// One comparison over the resolved value space.
///
/// `operator` is the wire string (`"=="`, `"contains"`, ...); the evaluator
/// rejects operators it does not recognize. `field` may itself contain
/// `${...}` references and is substituted before lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub source: ConditionSource,
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
    /// Step id or alias of the stored response, for `source: response`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
