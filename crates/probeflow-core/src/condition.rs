//! Condition evaluator: single comparisons and AND/OR groups over the
//! resolved value space.
//!
//! The field path is string-substituted before lookup, so references like
//! `items[${loop.index}].name` work. Expected values that contain `${...}`
//! are resolved and then coerced (`"true"` to bool, numeric strings to
//! numbers, `{`/`[` prefixes to parsed JSON). A missing operand compares per
//! the operator rules -- no error is raised for absent data.

use probeflow_types::condition::{
    Condition, ConditionExpr, ConditionGroup, ConditionSource, GroupOperator,
};
use serde_json::Value;
use thiserror::Error;

use crate::resolver::{self, ResolveContext, ResolveError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during condition evaluation.
#[derive(Debug, Clone, Error)]
pub enum ConditionError {
    /// The condition names an operator the evaluator does not know.
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    /// Expected-value coercion failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate an optional expression; an absent expression is true.
pub fn evaluate_optional(
    expr: Option<&ConditionExpr>,
    ctx: &ResolveContext<'_>,
) -> Result<bool, ConditionError> {
    match expr {
        Some(expr) => evaluate(expr, ctx),
        None => Ok(true),
    }
}

/// Evaluate a condition expression to a boolean.
pub fn evaluate(expr: &ConditionExpr, ctx: &ResolveContext<'_>) -> Result<bool, ConditionError> {
    match expr {
        ConditionExpr::Group(group) => evaluate_group(group, ctx),
        ConditionExpr::Single(cond) => evaluate_single(cond, ctx),
    }
}

/// Short-circuit AND/OR over the nested expressions. An empty group is true.
fn evaluate_group(group: &ConditionGroup, ctx: &ResolveContext<'_>) -> Result<bool, ConditionError> {
    match group.operator {
        GroupOperator::And => {
            for child in &group.conditions {
                if !evaluate(child, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        GroupOperator::Or => {
            if group.conditions.is_empty() {
                return Ok(true);
            }
            for child in &group.conditions {
                if evaluate(child, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn evaluate_single(cond: &Condition, ctx: &ResolveContext<'_>) -> Result<bool, ConditionError> {
    let field = resolver::substitute(&cond.field, ctx);

    let actual: Option<Value> = match cond.source {
        ConditionSource::Params => resolver::walk_path(ctx.params, &field).cloned(),
        ConditionSource::Response => {
            let body = cond
                .step_id
                .as_deref()
                .and_then(|id| ctx.responses.get(id));
            match body {
                Some(body) if field.is_empty() => Some(body.clone()),
                Some(body) => resolver::walk_path(body, &field).cloned(),
                None => None,
            }
        }
    };

    let expected = coerce_expected(&cond.value, ctx)?;
    apply_operator(&cond.operator, actual.as_ref(), &expected)
}

// ---------------------------------------------------------------------------
// Expected-value coercion
// ---------------------------------------------------------------------------

/// Resolve references in a string expected value and coerce the rendered
/// text back into a typed value. Non-strings and reference-free strings pass
/// through unchanged.
fn coerce_expected(value: &Value, ctx: &ResolveContext<'_>) -> Result<Value, ResolveError> {
    let Value::String(text) = value else {
        return Ok(value.clone());
    };
    if !text.contains("${") {
        return Ok(value.clone());
    }
    // A type-preserving single reference already comes back typed.
    match resolver::resolve_str(text, ctx) {
        Value::String(rendered) => coerce_literal(&rendered),
        typed => Ok(typed),
    }
}

fn coerce_literal(text: &str) -> Result<Value, ResolveError> {
    let trimmed = text.trim();
    match trimmed {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Some(number) = trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
    {
        return Ok(Value::Number(number));
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ResolveError::ExpectedValueParse {
            raw: trimmed.to_string(),
            message: e.to_string(),
        });
    }
    Ok(Value::String(text.to_string()))
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn apply_operator(
    operator: &str,
    actual: Option<&Value>,
    expected: &Value,
) -> Result<bool, ConditionError> {
    match operator {
        "==" => Ok(loose_eq(actual, expected)),
        "!=" => Ok(!loose_eq(actual, expected)),
        ">" | ">=" | "<" | "<=" => Ok(numeric_cmp(operator, actual, expected)),
        "contains" => Ok(contains(actual, expected)),
        "notContains" => Ok(!contains(actual, expected)),
        "isEmpty" => Ok(is_empty(actual)),
        "isNotEmpty" => Ok(!is_empty(actual)),
        "exists" => Ok(matches!(actual, Some(v) if !v.is_null())),
        other => Err(ConditionError::UnknownOperator(other.to_string())),
    }
}

/// Loose equality: strict value equality, or numeric equality after
/// coercing numbers and numeric strings. A missing operand equals null.
fn loose_eq(actual: Option<&Value>, expected: &Value) -> bool {
    let actual = actual.unwrap_or(&Value::Null);
    if actual == expected {
        return true;
    }
    match (coerce_number(actual), coerce_number(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ordering comparisons require both operands to be numbers.
fn numeric_cmp(operator: &str, actual: Option<&Value>, expected: &Value) -> bool {
    let (Some(a), Some(b)) = (
        actual.and_then(|v| v.as_f64()),
        expected.as_f64(),
    ) else {
        return false;
    };
    match operator {
        ">" => a > b,
        ">=" => a >= b,
        "<" => a < b,
        "<=" => a <= b,
        _ => false,
    }
}

/// Substring test on strings, membership test on lists.
fn contains(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(Value::String(haystack)) => {
            let needle = match expected {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return false,
            };
            haystack.contains(&needle)
        }
        Some(Value::Array(items)) => items.iter().any(|item| loose_eq(Some(item), expected)),
        _ => false,
    }
}

/// Null, missing, empty strings, empty lists, and empty mappings are empty;
/// every other value is not.
fn is_empty(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
