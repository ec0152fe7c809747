//! Template engine for flow configurations and conditions.
//!
//! Step configs, schedule inputs and conditions may embed expressions that
//! are resolved against the run's [`Context`] at dispatch time:
//!
//! ```text
//! {{ .Inputs.region }}
//! {{ .Steps.fetch.Outputs.status_code }}
//! {{ if .Steps.validate.Outputs.is_valid == true }}yes{{ else }}no{{ end }}
//! {{ default("GET", .Inputs.method) }}
//! ```
//!
//! The access-path grammar (`.Inputs.*`, `.Steps.<id>.Outputs.*`,
//! `.Steps.<id>.Status`, `.Env.*`) and the function library are the binding
//! contract; [`parse_expression`] documents the full expression syntax.
//!
//! [`render_value`] walks arbitrary JSON and renders string leaves only —
//! numbers, booleans, nested maps and arrays pass through structurally
//! untouched.

mod eval;
mod parser;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

pub use eval::{is_truthy, stringify};
pub use parser::{parse_expression, parse_template, BinaryOp, Expr, Segment};

/// Result of an executed step, exposed to templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The step's outputs.
    pub outputs: Map<String, Value>,
    /// Terminal status label: `"SUCCEEDED"` or `"FAILED"`.
    pub status: String,
}

/// Rendering context for one run.
///
/// Exposes the run inputs, per-step results accumulated as the run
/// progresses, and optional environment values.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Run inputs.
    pub inputs: Map<String, Value>,
    /// Results of completed steps, keyed by node id.
    pub steps: HashMap<String, StepResult>,
    /// Environment values exposed as `.Env.NAME`.
    pub env: HashMap<String, String>,
}

impl Context {
    /// Creates a context seeded with run inputs.
    #[must_use]
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            steps: HashMap::new(),
            env: HashMap::new(),
        }
    }

    /// Records a step result so later steps can reference it.
    pub fn add_step_result(
        &mut self,
        step_id: impl Into<String>,
        outputs: Option<Map<String, Value>>,
        status: impl Into<String>,
    ) {
        self.steps.insert(
            step_id.into(),
            StepResult {
                outputs: outputs.unwrap_or_default(),
                status: status.into(),
            },
        );
    }

    /// Sets an environment value.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Resolves an access path. Missing segments resolve to null rather than
    /// erroring, so templates can probe optional data.
    #[must_use]
    pub fn resolve_path(&self, segments: &[String]) -> Value {
        let Some((root, rest)) = segments.split_first() else {
            return Value::Null;
        };

        match root.as_str() {
            "Inputs" => resolve_in_object(&self.inputs, rest),
            "Env" => match rest {
                [name] => self
                    .env
                    .get(name)
                    .map_or(Value::Null, |v| Value::String(v.clone())),
                _ => Value::Null,
            },
            "Steps" => {
                let Some((step_id, step_rest)) = rest.split_first() else {
                    return Value::Null;
                };
                let Some(result) = self.steps.get(step_id) else {
                    return Value::Null;
                };
                match step_rest.split_first() {
                    Some((field, tail)) if field == "Outputs" => {
                        resolve_in_object(&result.outputs, tail)
                    }
                    Some((field, tail)) if field == "Status" && tail.is_empty() => {
                        Value::String(result.status.clone())
                    }
                    _ => Value::Null,
                }
            }
            _ => Value::Null,
        }
    }
}

fn resolve_in_object(object: &Map<String, Value>, path: &[String]) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return Value::Object(object.clone());
    };
    let mut current = match object.get(head) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

/// Renders a string template against a context.
///
/// Strings without `{{` pass through unchanged without parsing.
///
/// # Errors
///
/// Returns a template parse or render error.
pub fn render(template: &str, ctx: &Context) -> Result<String> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }
    let segments = parse_template(template)?;
    eval::render_segments(&segments, ctx)
}

/// Renders an arbitrary JSON value, recursing into maps and arrays and
/// rendering string leaves only. Non-string leaves are preserved.
///
/// # Errors
///
/// Returns a template parse or render error from any string leaf.
pub fn render_value(value: &Value, ctx: &Context) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(render(s, ctx)?)),
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (key, val) in map {
                rendered.insert(key.clone(), render_value(val, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items {
                rendered.push(render_value(item, ctx)?);
            }
            Ok(Value::Array(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Renders a step config map.
///
/// # Errors
///
/// Returns a template parse or render error from any string leaf.
pub fn render_config(config: &Map<String, Value>, ctx: &Context) -> Result<Map<String, Value>> {
    let mut rendered = Map::with_capacity(config.len());
    for (key, value) in config {
        rendered.insert(key.clone(), render_value(value, ctx)?);
    }
    Ok(rendered)
}

/// Renders a condition expression to a boolean.
///
/// The expression is wrapped in an if-block producing the literal `"true"`
/// or `"false"`, so a condition is any expression the truthiness rules
/// apply to. An empty condition is vacuously true.
///
/// # Errors
///
/// Returns a template parse or render error.
pub fn render_condition(condition: &str, ctx: &Context) -> Result<bool> {
    if condition.is_empty() {
        return Ok(true);
    }
    let wrapped = format!("{{{{ if {condition} }}}}true{{{{ else }}}}false{{{{ end }}}}");
    Ok(render(&wrapped, ctx)? == "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        let mut ctx = Context::new(
            json!({"region": "eu", "count": 2, "nested": {"a": {"b": 7}}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        ctx.add_step_result(
            "fetch",
            Some(json!({"status_code": 503, "body": "oops"}).as_object().cloned().unwrap()),
            "FAILED",
        );
        ctx.set_env("STAGE", "prod");
        ctx
    }

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(render("no templates here", &ctx()).unwrap(), "no templates here");
    }

    #[test]
    fn interpolation_renders_paths() {
        let ctx = ctx();
        assert_eq!(render("region={{ .Inputs.region }}", &ctx).unwrap(), "region=eu");
        assert_eq!(render("{{ .Inputs.nested.a.b }}", &ctx).unwrap(), "7");
        assert_eq!(render("{{ .Env.STAGE }}", &ctx).unwrap(), "prod");
        assert_eq!(render("{{ .Steps.fetch.Status }}", &ctx).unwrap(), "FAILED");
        // Missing data renders as empty string.
        assert_eq!(render("[{{ .Inputs.ghost }}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn if_blocks_select_branches() {
        let ctx = ctx();
        let out = render(
            "{{ if .Steps.fetch.Outputs.status_code >= 500 }}retry{{ else }}ok{{ end }}",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "retry");
    }

    #[test]
    fn render_value_preserves_non_string_leaves() {
        let ctx = ctx();
        let input = json!({
            "url": "https://api/{{ .Inputs.region }}",
            "timeout_sec": 30,
            "verify": true,
            "tags": ["{{ .Env.STAGE }}", 5],
            "nested": {"count": 2.5}
        });
        let rendered = render_value(&input, &ctx).unwrap();
        assert_eq!(
            rendered,
            json!({
                "url": "https://api/eu",
                "timeout_sec": 30,
                "verify": true,
                "tags": ["prod", 5],
                "nested": {"count": 2.5}
            })
        );
    }

    #[test]
    fn render_condition_truthiness() {
        let ctx = ctx();
        assert!(render_condition("", &ctx).unwrap());
        assert!(render_condition(".Inputs.count == 2", &ctx).unwrap());
        assert!(!render_condition(".Inputs.ghost", &ctx).unwrap());
        assert!(render_condition(r#".Steps.fetch.Status == "FAILED""#, &ctx).unwrap());
        assert!(!render_condition("false", &ctx).unwrap());
    }

    #[test]
    fn render_condition_propagates_parse_errors() {
        assert!(render_condition(".Inputs.", &ctx()).is_err());
    }

    #[test]
    fn steps_path_requires_outputs_or_status() {
        let ctx = ctx();
        assert_eq!(
            ctx.resolve_path(&["Steps".into(), "fetch".into(), "Other".into()]),
            Value::Null
        );
    }
}
