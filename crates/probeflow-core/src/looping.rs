//! Loop iterator: per-iteration contexts for forEach / count / while loops.
//!
//! The iterator owns the iteration plan and the ceiling policy; condition
//! evaluation stays with the caller, which feeds the while condition in at
//! construction and refreshes it after each body pass via
//! [`LoopIterator::update_condition`]. forEach and count totals are clamped
//! to the ceiling up front; a while loop whose condition still holds at the
//! ceiling raises [`LoopError::LimitExceeded`].

use probeflow_types::execution::LoopFrame;
use probeflow_types::scenario::LoopKind;
use serde_json::Value;
use thiserror::Error;

use crate::resolver::{self, ResolveContext, ResolveError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while building or advancing a loop.
#[derive(Debug, Clone, Error)]
pub enum LoopError {
    /// Source resolution failed (missing value, not a list).
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The loop wanted to iterate past its ceiling.
    #[error("loop '{loop_id}' exceeded its iteration ceiling of {max}")]
    LimitExceeded { loop_id: String, max: u32 },
}

// ---------------------------------------------------------------------------
// LoopIterator
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum IterationPlan {
    /// Expanded forEach items.
    Items(Vec<Value>),
    /// Resolved count-loop total.
    Count(u32),
    /// While loop; the caller refreshes the condition between iterations.
    While { condition_holds: bool },
}

/// Produces one [`LoopFrame`] per iteration of a loop step.
#[derive(Debug)]
pub struct LoopIterator {
    loop_id: String,
    loop_name: String,
    item_alias: Option<String>,
    index_alias: Option<String>,
    plan: IterationPlan,
    max_iterations: u32,
    current_index: u32,
}

impl LoopIterator {
    /// Build an iterator for a loop descriptor.
    ///
    /// `while_condition` seeds the first check for while loops (evaluated by
    /// the caller once, up front) and is ignored for other kinds.
    pub fn new(
        loop_id: &str,
        loop_name: &str,
        kind: &LoopKind,
        ctx: &ResolveContext<'_>,
        while_condition: bool,
    ) -> Result<Self, LoopError> {
        let max_iterations = kind.iteration_ceiling();
        let (plan, item_alias, index_alias) = match kind {
            LoopKind::ForEach {
                source,
                item_alias,
                index_alias,
                count_field,
                ..
            } => {
                let items = resolve_source(source, ctx)?;
                let expanded = match count_field {
                    Some(field) => expand_count_field(items, field, max_iterations as usize),
                    None => items,
                };
                (
                    IterationPlan::Items(expanded),
                    Some(item_alias.clone()),
                    index_alias.clone(),
                )
            }
            LoopKind::Count { count, .. } => {
                (IterationPlan::Count(resolve_count(count, ctx)), None, None)
            }
            LoopKind::While { .. } => (
                IterationPlan::While {
                    condition_holds: while_condition,
                },
                None,
                None,
            ),
        };

        Ok(Self {
            loop_id: loop_id.to_string(),
            loop_name: loop_name.to_string(),
            item_alias,
            index_alias,
            plan,
            max_iterations,
            current_index: 0,
        })
    }

    /// Total iterations when known up front (forEach/count); `None` for
    /// while loops, which are open-ended.
    pub fn total_iterations(&self) -> Option<u32> {
        match &self.plan {
            IterationPlan::Items(items) => Some((items.len() as u32).min(self.max_iterations)),
            IterationPlan::Count(count) => Some((*count).min(self.max_iterations)),
            IterationPlan::While { .. } => None,
        }
    }

    /// Zero-based index of the next frame.
    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    /// Whether another frame is available.
    pub fn has_next(&self) -> bool {
        match &self.plan {
            IterationPlan::Items(_) | IterationPlan::Count(_) => {
                self.current_index < self.total_iterations().unwrap_or(0)
            }
            IterationPlan::While { condition_holds } => {
                *condition_holds && self.current_index < self.max_iterations
            }
        }
    }

    /// Produce the next frame and advance exactly one position.
    ///
    /// `Ok(None)` means the loop is exhausted. A while loop whose condition
    /// still holds at the ceiling raises `LimitExceeded`.
    pub fn next_frame(&mut self) -> Result<Option<LoopFrame>, LoopError> {
        match &self.plan {
            IterationPlan::Items(items) => {
                let total = self.total_iterations().unwrap_or(0);
                if self.current_index >= total {
                    return Ok(None);
                }
                let item = items[self.current_index as usize].clone();
                let frame = self.frame(Some(item));
                self.current_index += 1;
                Ok(Some(frame))
            }
            IterationPlan::Count(_) => {
                let total = self.total_iterations().unwrap_or(0);
                if self.current_index >= total {
                    return Ok(None);
                }
                let frame = self.frame(None);
                self.current_index += 1;
                Ok(Some(frame))
            }
            IterationPlan::While { condition_holds } => {
                if !*condition_holds {
                    return Ok(None);
                }
                if self.current_index >= self.max_iterations {
                    return Err(LoopError::LimitExceeded {
                        loop_id: self.loop_id.clone(),
                        max: self.max_iterations,
                    });
                }
                let frame = self.frame(None);
                self.current_index += 1;
                Ok(Some(frame))
            }
        }
    }

    /// Refresh the while condition after an iteration. No-op for other
    /// kinds.
    pub fn update_condition(&mut self, holds: bool) {
        if let IterationPlan::While { condition_holds } = &mut self.plan {
            *condition_holds = holds;
        }
    }

    /// Rewind to the first iteration. Idempotent.
    pub fn reset(&mut self) {
        self.current_index = 0;
    }

    fn frame(&self, current_item: Option<Value>) -> LoopFrame {
        LoopFrame {
            loop_id: self.loop_id.clone(),
            loop_name: self.loop_name.clone(),
            current_index: self.current_index,
            total_iterations: self.total_iterations(),
            current_item,
            item_alias: self.item_alias.clone(),
            index_alias: self.index_alias.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Source resolution
// ---------------------------------------------------------------------------

/// Resolve a forEach source to its list. The source may be a bare path
/// (`params.items`) or a `${...}` reference.
fn resolve_source(source: &str, ctx: &ResolveContext<'_>) -> Result<Vec<Value>, ResolveError> {
    let resolved = if source.contains("${") {
        match resolver::resolve_str(source, ctx) {
            Value::Null => None,
            value => Some(value),
        }
    } else {
        resolver::lookup(source, ctx)
    };

    let Some(value) = resolved else {
        let hint = if source.contains("response") {
            "; a response saved by a fire-and-forget request may not have arrived yet"
        } else {
            ""
        };
        return Err(ResolveError::SourceUnresolved {
            path: source.to_string(),
            hint: hint.to_string(),
        });
    };

    match value {
        Value::Array(items) => Ok(items),
        other => Err(ResolveError::SourceNotList {
            path: source.to_string(),
            found: json_type_name(&other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Repeat each item `item[count_field]` times. Non-numeric or non-positive
/// counts contribute a single copy. Expansion stops at `limit` entries.
fn expand_count_field(items: Vec<Value>, count_field: &str, limit: usize) -> Vec<Value> {
    let mut expanded = Vec::new();
    for item in items {
        let copies = item
            .get(count_field)
            .and_then(Value::as_f64)
            .map(f64::floor)
            .filter(|n| *n > 0.0)
            .map(|n| n as usize)
            .unwrap_or(1);
        for _ in 0..copies {
            if expanded.len() >= limit {
                return expanded;
            }
            expanded.push(item.clone());
        }
    }
    expanded
}

/// Resolve a count-loop total to a non-negative integer (floored).
fn resolve_count(count: &Value, ctx: &ResolveContext<'_>) -> u32 {
    let resolved = match count {
        Value::String(s) => resolver::resolve_str(s, ctx),
        other => other.clone(),
    };
    let number = match resolved {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.map(|n| n.max(0.0).floor() as u32).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use probeflow_types::condition::{Condition, ConditionExpr, ConditionSource};
    use serde_json::json;
    use std::collections::HashMap;

    struct Fixture {
        params: Value,
        responses: HashMap<String, Value>,
    }

    impl Fixture {
        fn new(params: Value) -> Self {
            Self {
                params,
                responses: HashMap::new(),
            }
        }

        fn ctx(&self) -> ResolveContext<'_> {
            ResolveContext {
                params: &self.params,
                responses: &self.responses,
                loop_stack: &[],
                timestamp: Utc::now(),
            }
        }
    }

    fn for_each(source: &str, count_field: Option<&str>, max: Option<u32>) -> LoopKind {
        LoopKind::ForEach {
            source: source.to_string(),
            item_alias: "item".to_string(),
            index_alias: Some("i".to_string()),
            count_field: count_field.map(String::from),
            max_iterations: max,
        }
    }

    fn drain(iter: &mut LoopIterator) -> Vec<LoopFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = iter.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    // -------------------------------------------------------------------
    // forEach
    // -------------------------------------------------------------------

    #[test]
    fn test_for_each_basic_iteration() {
        let fx = Fixture::new(json!({ "items": [1, 2, 3] }));
        let kind = for_each("params.items", None, None);
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();

        assert_eq!(iter.total_iterations(), Some(3));
        let frames = drain(&mut iter);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].current_index, 0);
        assert_eq!(frames[2].current_index, 2);
        assert_eq!(frames[1].current_item, Some(json!(2)));
        assert_eq!(frames[0].item_alias.as_deref(), Some("item"));
    }

    #[test]
    fn test_for_each_empty_list_zero_iterations() {
        let fx = Fixture::new(json!({ "items": [] }));
        let kind = for_each("params.items", None, None);
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert_eq!(iter.total_iterations(), Some(0));
        assert!(!iter.has_next());
        assert!(iter.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_for_each_reference_source_form() {
        let fx = Fixture::new(json!({ "items": ["a", "b"] }));
        let kind = for_each("${params.items}", None, None);
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert_eq!(drain(&mut iter).len(), 2);
    }

    #[test]
    fn test_for_each_count_field_expansion() {
        let fx = Fixture::new(json!({
            "items": [{ "id": 1, "repeat": 2 }, { "id": 2, "repeat": 3 }]
        }));
        let kind = for_each("params.items", Some("repeat"), None);
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();

        assert_eq!(iter.total_iterations(), Some(5));
        let ids: Vec<_> = drain(&mut iter)
            .into_iter()
            .map(|f| f.current_item.unwrap()["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(1), json!(1), json!(2), json!(2), json!(2)]);
    }

    #[test]
    fn test_count_field_non_numeric_contributes_one() {
        let fx = Fixture::new(json!({
            "items": [{ "repeat": "x" }, { "repeat": 0 }, {}]
        }));
        let kind = for_each("params.items", Some("repeat"), None);
        let iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert_eq!(iter.total_iterations(), Some(3));
    }

    #[test]
    fn test_for_each_clamps_to_ceiling() {
        let fx = Fixture::new(json!({ "items": [1, 2, 3, 4, 5] }));
        let kind = for_each("params.items", None, Some(2));
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert_eq!(iter.total_iterations(), Some(2));
        assert_eq!(drain(&mut iter).len(), 2);
    }

    #[test]
    fn test_for_each_missing_source_names_path() {
        let fx = Fixture::new(json!({}));
        let kind = for_each("params.missing", None, None);
        let err = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap_err();
        assert!(err.to_string().contains("params.missing"));
    }

    #[test]
    fn test_for_each_response_source_hints_fire_and_forget() {
        let fx = Fixture::new(json!({}));
        let kind = for_each("response.poll.items", None, None);
        let err = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap_err();
        assert!(err.to_string().contains("fire-and-forget"));
    }

    #[test]
    fn test_for_each_non_list_source_is_error() {
        let fx = Fixture::new(json!({ "items": "not a list" }));
        let kind = for_each("params.items", None, None);
        let err = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap_err();
        assert!(matches!(
            err,
            LoopError::Resolve(ResolveError::SourceNotList { .. })
        ));
    }

    // -------------------------------------------------------------------
    // count
    // -------------------------------------------------------------------

    #[test]
    fn test_count_loop_basic() {
        let fx = Fixture::new(json!({}));
        let kind = LoopKind::Count {
            count: json!(3),
            max_iterations: None,
        };
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        let frames = drain(&mut iter);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.current_item.is_none()));
    }

    #[test]
    fn test_count_zero_performs_no_iterations() {
        let fx = Fixture::new(json!({}));
        let kind = LoopKind::Count {
            count: json!(0),
            max_iterations: None,
        };
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert!(!iter.has_next());
        assert!(iter.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_count_resolves_and_floors() {
        let fx = Fixture::new(json!({ "n": "2.9" }));
        let kind = LoopKind::Count {
            count: json!("${params.n}"),
            max_iterations: None,
        };
        let iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert_eq!(iter.total_iterations(), Some(2));
    }

    #[test]
    fn test_count_negative_coerces_to_zero() {
        let fx = Fixture::new(json!({}));
        let kind = LoopKind::Count {
            count: json!(-4),
            max_iterations: None,
        };
        let iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert_eq!(iter.total_iterations(), Some(0));
    }

    #[test]
    fn test_count_clamps_to_ceiling() {
        let fx = Fixture::new(json!({}));
        let kind = LoopKind::Count {
            count: json!(50),
            max_iterations: Some(10),
        };
        let iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert_eq!(iter.total_iterations(), Some(10));
    }

    // -------------------------------------------------------------------
    // while
    // -------------------------------------------------------------------

    fn while_kind(max: Option<u32>) -> LoopKind {
        LoopKind::While {
            condition: ConditionExpr::Single(Condition {
                source: ConditionSource::Params,
                field: "pending".to_string(),
                operator: "==".to_string(),
                value: json!(true),
                step_id: None,
            }),
            max_iterations: max,
        }
    }

    #[test]
    fn test_while_initially_false_zero_iterations() {
        let fx = Fixture::new(json!({}));
        let mut iter = LoopIterator::new("l", "L", &while_kind(None), &fx.ctx(), false).unwrap();
        assert!(!iter.has_next());
        assert!(iter.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_while_stops_when_condition_cleared() {
        let fx = Fixture::new(json!({}));
        let mut iter = LoopIterator::new("l", "L", &while_kind(Some(10)), &fx.ctx(), true).unwrap();
        assert!(iter.next_frame().unwrap().is_some());
        assert!(iter.next_frame().unwrap().is_some());
        iter.update_condition(false);
        assert!(!iter.has_next());
        assert!(iter.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_while_at_exact_ceiling_succeeds() {
        let fx = Fixture::new(json!({}));
        let mut iter = LoopIterator::new("l", "L", &while_kind(Some(3)), &fx.ctx(), true).unwrap();
        for _ in 0..3 {
            assert!(iter.next_frame().unwrap().is_some());
        }
        // Condition cleared exactly at the ceiling: clean exit, no error
        iter.update_condition(false);
        assert!(iter.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_while_past_ceiling_raises_limit_exceeded() {
        let fx = Fixture::new(json!({}));
        let mut iter = LoopIterator::new("l", "L", &while_kind(Some(3)), &fx.ctx(), true).unwrap();
        for _ in 0..3 {
            iter.next_frame().unwrap();
        }
        let err = iter.next_frame().unwrap_err();
        assert!(matches!(err, LoopError::LimitExceeded { max: 3, .. }));
    }

    // -------------------------------------------------------------------
    // Iterator mechanics
    // -------------------------------------------------------------------

    #[test]
    fn test_next_advances_exactly_once() {
        let fx = Fixture::new(json!({ "items": [10, 20] }));
        let kind = for_each("params.items", None, None);
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        assert_eq!(iter.current_index(), 0);
        iter.next_frame().unwrap();
        assert_eq!(iter.current_index(), 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let fx = Fixture::new(json!({ "items": [1, 2] }));
        let kind = for_each("params.items", None, None);
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        drain(&mut iter);
        iter.reset();
        assert_eq!(iter.current_index(), 0);
        iter.reset();
        assert_eq!(iter.current_index(), 0);
        assert_eq!(drain(&mut iter).len(), 2);
    }

    #[test]
    fn test_iterator_does_not_mutate_source() {
        let fx = Fixture::new(json!({ "items": [1, 2, 3] }));
        let kind = for_each("params.items", None, None);
        let mut iter = LoopIterator::new("l", "L", &kind, &fx.ctx(), false).unwrap();
        drain(&mut iter);
        assert_eq!(fx.params["items"], json!([1, 2, 3]));
    }
}
