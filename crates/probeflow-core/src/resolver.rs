//! Variable resolver: expands `${...}` references against a layered context.
//!
//! Supported reference roots:
//! - `params.<dotted.path[index]>` -- from the execution parameters
//! - `response.<stepIdOrAlias>` / `response.<stepIdOrAlias>.<path>` -- the
//!   bare form returns the whole saved response body
//! - `loop.index`, `loop.item`, `loop.item.<path>` -- the innermost frame of
//!   the loop context stack
//! - `system.timestamp` -- captured once at execution start
//!
//! A string that consists of exactly one reference resolves type-preserving;
//! references embedded in surrounding text render to strings. Missing paths
//! resolve to nothing -- resolution itself never fails, consumers decide
//! whether an absent value is acceptable.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use probeflow_types::execution::LoopFrame;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Matches one `${...}` reference.
static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("reference pattern is valid"));

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Resolution failures surfaced to consumers that require a concrete value.
///
/// Plain reference expansion never raises; these arise when a loop source or
/// a coerced expected value must take a particular shape.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// A forEach source resolved to nothing.
    #[error("forEach source '{path}' did not resolve to a value{hint}")]
    SourceUnresolved { path: String, hint: String },

    /// A forEach source resolved to a non-list value.
    #[error("forEach source '{path}' resolved to {found}, expected a list")]
    SourceNotList { path: String, found: &'static str },

    /// A resolved expected value looked like JSON but failed to parse.
    #[error("failed to parse expected value '{raw}' as JSON: {message}")]
    ExpectedValueParse { raw: String, message: String },
}

// ---------------------------------------------------------------------------
// ResolveContext
// ---------------------------------------------------------------------------

/// Read-only view of the value space a template resolves against.
///
/// The loop context stack is passed in explicitly -- there is no hidden
/// module state, which keeps resolution pure and testable in isolation.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub params: &'a Value,
    /// Saved response bodies keyed by alias or step id.
    pub responses: &'a HashMap<String, Value>,
    /// Active loop frames, innermost last.
    pub loop_stack: &'a [LoopFrame],
    /// Captured once at execution start; every `${system.timestamp}` in a
    /// run renders the same instant.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a template of any shape. Strings are substituted, lists and
/// mappings are walked recursively, other scalars pass through unchanged.
pub fn resolve(template: &Value, ctx: &ResolveContext<'_>) -> Value {
    match template {
        Value::String(s) => resolve_str(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a string template.
///
/// When the entire trimmed string is exactly one reference, the referenced
/// value is returned with its type; a missing path yields `Null`. Otherwise
/// every reference is rendered into the surrounding text.
pub fn resolve_str(template: &str, ctx: &ResolveContext<'_>) -> Value {
    let trimmed = template.trim();
    if let Some(caps) = REFERENCE.captures(trimmed) {
        let full = caps.get(0).expect("group 0 always present");
        if full.start() == 0 && full.end() == trimmed.len() {
            return lookup(&caps[1], ctx).unwrap_or(Value::Null);
        }
    }
    Value::String(substitute(template, ctx))
}

/// Render every reference in a string to text. Missing values and nulls
/// render empty, lists and mappings render as compact JSON.
pub fn substitute(template: &str, ctx: &ResolveContext<'_>) -> String {
    if !template.contains("${") {
        return template.to_string();
    }
    REFERENCE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            render(lookup(&caps[1], ctx))
        })
        .into_owned()
}

fn render(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => serde_json::to_string(&other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Path lookup
// ---------------------------------------------------------------------------

/// Look up a single reference path. `None` means the path does not resolve.
pub fn lookup(path: &str, ctx: &ResolveContext<'_>) -> Option<Value> {
    let path = path.trim();
    let (root, rest) = match path.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (path, None),
    };

    match root {
        "params" => match rest {
            Some(rest) => walk_path(ctx.params, rest).cloned(),
            None => Some(ctx.params.clone()),
        },
        "response" => {
            let rest = rest?;
            let (key, sub) = match rest.split_once('.') {
                Some((key, sub)) => (key, Some(sub)),
                None => (rest, None),
            };
            let body = ctx.responses.get(key)?;
            match sub {
                Some(sub) => walk_path(body, sub).cloned(),
                None => Some(body.clone()),
            }
        }
        "loop" => {
            let frame = ctx.loop_stack.last()?;
            match rest? {
                "index" => Some(Value::from(frame.current_index)),
                "item" => frame.current_item.clone(),
                other => {
                    let sub = other.strip_prefix("item.")?;
                    walk_path(frame.current_item.as_ref()?, sub).cloned()
                }
            }
        }
        "system" => match rest? {
            "timestamp" => Some(Value::String(
                ctx.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            _ => None,
        },
        _ => None,
    }
}

/// Walk a dotted path with optional bracket indices (`a.b[0].c`) into a
/// value. A missing or malformed segment yields `None`.
pub fn walk_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = root;
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let (name, mut brackets) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !name.is_empty() {
            current = current.get(name)?;
        }
        while let Some(close) = brackets.find(']') {
            let index: usize = brackets[1..close].trim().parse().ok()?;
            current = current.get(index)?;
            brackets = &brackets[close + 1..];
            if !brackets.is_empty() && !brackets.starts_with('[') {
                return None;
            }
        }
        if !brackets.is_empty() {
            return None;
        }
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(index: u32, item: Value) -> LoopFrame {
        LoopFrame {
            loop_id: "l1".to_string(),
            loop_name: "Loop".to_string(),
            current_index: index,
            total_iterations: Some(10),
            current_item: Some(item),
            item_alias: Some("item".to_string()),
            index_alias: None,
        }
    }

    struct Fixture {
        params: Value,
        responses: HashMap<String, Value>,
        loop_stack: Vec<LoopFrame>,
        timestamp: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                params: json!({
                    "id": 42,
                    "name": "probe",
                    "flags": { "dry_run": true },
                    "items": [{ "sku": "a-1" }, { "sku": "b-2" }]
                }),
                responses: HashMap::from([(
                    "login".to_string(),
                    json!({ "ok": true, "token": "t0k", "user": { "roles": ["admin"] } }),
                )]),
                loop_stack: vec![],
                timestamp: "2026-08-01T10:00:00Z".parse().unwrap(),
            }
        }

        fn ctx(&self) -> ResolveContext<'_> {
            ResolveContext {
                params: &self.params,
                responses: &self.responses,
                loop_stack: &self.loop_stack,
                timestamp: self.timestamp,
            }
        }
    }

    // -------------------------------------------------------------------
    // String substitution
    // -------------------------------------------------------------------

    #[test]
    fn test_variable_free_template_unchanged() {
        let fx = Fixture::new();
        assert_eq!(
            resolve_str("no references here", &fx.ctx()),
            json!("no references here")
        );
    }

    #[test]
    fn test_embedded_reference_renders_to_string() {
        let fx = Fixture::new();
        assert_eq!(
            resolve_str("user ${params.id} (${params.name})", &fx.ctx()),
            json!("user 42 (probe)")
        );
    }

    #[test]
    fn test_missing_reference_renders_empty() {
        let fx = Fixture::new();
        assert_eq!(resolve_str("x=${params.nope}", &fx.ctx()), json!("x="));
    }

    #[test]
    fn test_list_renders_as_json_in_text() {
        let fx = Fixture::new();
        let resolved = resolve_str("items: ${params.items}", &fx.ctx());
        assert_eq!(
            resolved,
            json!(r#"items: [{"sku":"a-1"},{"sku":"b-2"}]"#)
        );
    }

    // -------------------------------------------------------------------
    // Type-preserving single references
    // -------------------------------------------------------------------

    #[test]
    fn test_single_reference_preserves_number() {
        let fx = Fixture::new();
        assert_eq!(resolve_str("${params.id}", &fx.ctx()), json!(42));
    }

    #[test]
    fn test_single_reference_preserves_bool_list_map() {
        let fx = Fixture::new();
        assert_eq!(resolve_str("${params.flags.dry_run}", &fx.ctx()), json!(true));
        assert_eq!(
            resolve_str("${params.items}", &fx.ctx()),
            fx.params["items"]
        );
        assert_eq!(resolve_str("${params.flags}", &fx.ctx()), fx.params["flags"]);
    }

    #[test]
    fn test_single_reference_trims_whitespace() {
        let fx = Fixture::new();
        assert_eq!(resolve_str("  ${params.id}  ", &fx.ctx()), json!(42));
    }

    #[test]
    fn test_single_reference_missing_is_null() {
        let fx = Fixture::new();
        assert_eq!(resolve_str("${params.missing.deep}", &fx.ctx()), Value::Null);
        assert_eq!(resolve_str("${response.never}", &fx.ctx()), Value::Null);
    }

    // -------------------------------------------------------------------
    // Responses
    // -------------------------------------------------------------------

    #[test]
    fn test_response_bare_form_returns_whole_body() {
        let fx = Fixture::new();
        assert_eq!(
            resolve_str("${response.login}", &fx.ctx()),
            fx.responses["login"]
        );
    }

    #[test]
    fn test_response_dotted_form_reaches_inside() {
        let fx = Fixture::new();
        assert_eq!(resolve_str("${response.login.token}", &fx.ctx()), json!("t0k"));
        assert_eq!(
            resolve_str("${response.login.user.roles[0]}", &fx.ctx()),
            json!("admin")
        );
    }

    // -------------------------------------------------------------------
    // Loop references
    // -------------------------------------------------------------------

    #[test]
    fn test_loop_references_use_innermost_frame() {
        let mut fx = Fixture::new();
        fx.loop_stack.push(frame(0, json!({"sku": "outer"})));
        fx.loop_stack.push(frame(3, json!({"sku": "inner", "qty": 2})));

        assert_eq!(resolve_str("${loop.index}", &fx.ctx()), json!(3));
        assert_eq!(resolve_str("${loop.item.sku}", &fx.ctx()), json!("inner"));
        assert_eq!(
            resolve_str("${loop.item}", &fx.ctx()),
            json!({"sku": "inner", "qty": 2})
        );
    }

    #[test]
    fn test_loop_reference_outside_any_loop_is_empty() {
        let fx = Fixture::new();
        assert_eq!(resolve_str("i=${loop.index}", &fx.ctx()), json!("i="));
    }

    // -------------------------------------------------------------------
    // System
    // -------------------------------------------------------------------

    #[test]
    fn test_system_timestamp_is_iso8601_utc() {
        let fx = Fixture::new();
        assert_eq!(
            resolve_str("${system.timestamp}", &fx.ctx()),
            json!("2026-08-01T10:00:00.000Z")
        );
    }

    // -------------------------------------------------------------------
    // Deep resolution
    // -------------------------------------------------------------------

    #[test]
    fn test_deep_resolution_walks_maps_and_lists() {
        let fx = Fixture::new();
        let template = json!({
            "n": "${params.id}",
            "nested": { "token": "${response.login.token}" },
            "list": ["${params.name}", 7, null]
        });
        assert_eq!(
            resolve(&template, &fx.ctx()),
            json!({
                "n": 42,
                "nested": { "token": "t0k" },
                "list": ["probe", 7, null]
            })
        );
    }

    #[test]
    fn test_scalars_pass_through() {
        let fx = Fixture::new();
        assert_eq!(resolve(&json!(7), &fx.ctx()), json!(7));
        assert_eq!(resolve(&json!(null), &fx.ctx()), json!(null));
        assert_eq!(resolve(&json!(true), &fx.ctx()), json!(true));
    }

    // -------------------------------------------------------------------
    // Path walking
    // -------------------------------------------------------------------

    #[test]
    fn test_walk_path_bracket_indices() {
        let value = json!({ "rows": [[1, 2], [3, 4]] });
        assert_eq!(walk_path(&value, "rows[1][0]"), Some(&json!(3)));
        assert_eq!(walk_path(&value, "rows[9]"), None);
        assert_eq!(walk_path(&value, "rows[x]"), None);
    }

    #[test]
    fn test_walk_path_rejects_malformed_segments() {
        let value = json!({ "a": [1] });
        assert_eq!(walk_path(&value, "a[0"), None);
        assert_eq!(walk_path(&value, "a..b"), None);
    }
}
