//! Template evaluation: segment tree plus context to output text.

use serde_json::Value;

use crate::error::{Error, Result};

use super::parser::{BinaryOp, Expr, Segment};
use super::Context;

fn render_err(message: impl Into<String>) -> Error {
    Error::TemplateRender {
        message: message.into(),
    }
}

/// Renders a segment tree against a context.
pub(super) fn render_segments(segments: &[Segment], ctx: &Context) -> Result<String> {
    let mut out = String::new();
    write_segments(segments, ctx, &mut out)?;
    Ok(out)
}

fn write_segments(segments: &[Segment], ctx: &Context, out: &mut String) -> Result<()> {
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Expr(expr) => out.push_str(&stringify(&eval(expr, ctx)?)),
            Segment::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let branch = if is_truthy(&eval(cond, ctx)?) {
                    then_branch
                } else {
                    else_branch
                };
                write_segments(branch, ctx, out)?;
            }
        }
    }
    Ok(())
}

/// Evaluates an expression against a context.
pub(super) fn eval(expr: &Expr, ctx: &Context) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(ctx.resolve_path(segments)),
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, ctx)?))),
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx)?);
            }
            call_function(name, values)
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, ctx),
    }
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, ctx: &Context) -> Result<Value> {
    // Short-circuit the logical operators before evaluating the right side.
    match op {
        BinaryOp::And => {
            let left = eval(lhs, ctx)?;
            if !is_truthy(&left) {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(is_truthy(&eval(rhs, ctx)?)));
        }
        BinaryOp::Or => {
            let left = eval(lhs, ctx)?;
            if is_truthy(&left) {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(is_truthy(&eval(rhs, ctx)?)));
        }
        _ => {}
    }

    let left = eval(lhs, ctx)?;
    let right = eval(rhs, ctx)?;

    let result = match op {
        BinaryOp::Eq => values_equal(&left, &right),
        BinaryOp::Ne => !values_equal(&left, &right),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare_values(&left, &right)?;
            match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!(),
    };

    Ok(Value::Bool(result))
}

/// Equality with numeric coercion: `1 == 1.0` holds.
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return (l - r).abs() < f64::EPSILON;
    }
    left == right
}

fn compare_values(left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l
            .partial_cmp(&r)
            .ok_or_else(|| render_err("cannot order NaN"));
    }
    if let (Value::String(l), Value::String(r)) = (left, right) {
        return Ok(l.cmp(r));
    }
    Err(render_err(format!(
        "cannot compare {} with {}",
        type_name(left),
        type_name(right)
    )))
}

/// Converts a value to its interpolated text form.
///
/// Null renders as the empty string; arrays and objects render as compact
/// JSON. This is the contract templates rely on when splicing step outputs
/// into configs.
#[must_use]
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Truthiness for conditions: null, false, zero, empty string, empty array
/// and empty object are falsy; everything else is truthy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(render_err(format!(
            "{name} expects {expected} argument(s), got {}",
            args.len()
        )))
    }
}

fn string_arg(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(render_err(format!(
            "{name} expects a string argument, got {}",
            type_name(other)
        ))),
    }
}

#[allow(clippy::too_many_lines)]
fn call_function(name: &str, args: Vec<Value>) -> Result<Value> {
    match name {
        // json / toJSON serialize any value to its JSON text.
        "json" | "toJSON" => {
            arity(name, &args, 1)?;
            Ok(Value::String(args[0].to_string()))
        }
        // fromJSON parses a JSON string; invalid input yields null, matching
        // the lenient behavior templates expect.
        "fromJSON" => {
            arity(name, &args, 1)?;
            let raw = string_arg(name, &args[0])?;
            Ok(serde_json::from_str(&raw).unwrap_or(Value::Null))
        }
        // default(def, val) falls back when val is null or the empty string.
        "default" => {
            arity(name, &args, 2)?;
            let mut args = args.into_iter();
            let def = args.next().unwrap_or(Value::Null);
            let val = args.next().unwrap_or(Value::Null);
            let is_empty =
                matches!(&val, Value::Null) || matches!(&val, Value::String(s) if s.is_empty());
            Ok(if is_empty { def } else { val })
        }
        // coalesce returns the first non-null, non-empty-string argument.
        "coalesce" => Ok(args
            .into_iter()
            .find(|v| {
                !matches!(v, Value::Null) && !matches!(v, Value::String(s) if s.is_empty())
            })
            .unwrap_or(Value::Null)),
        "join" => {
            arity(name, &args, 2)?;
            let sep = string_arg(name, &args[0])?;
            let Value::Array(items) = &args[1] else {
                return Err(render_err("join expects an array as second argument"));
            };
            let parts: Vec<String> = items.iter().map(stringify).collect();
            Ok(Value::String(parts.join(&sep)))
        }
        "split" => {
            arity(name, &args, 2)?;
            let sep = string_arg(name, &args[0])?;
            let s = string_arg(name, &args[1])?;
            Ok(Value::Array(
                s.split(sep.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        "contains" => {
            arity(name, &args, 2)?;
            let s = string_arg(name, &args[0])?;
            let needle = string_arg(name, &args[1])?;
            Ok(Value::Bool(s.contains(&needle)))
        }
        "hasPrefix" => {
            arity(name, &args, 2)?;
            let s = string_arg(name, &args[0])?;
            let prefix = string_arg(name, &args[1])?;
            Ok(Value::Bool(s.starts_with(&prefix)))
        }
        "hasSuffix" => {
            arity(name, &args, 2)?;
            let s = string_arg(name, &args[0])?;
            let suffix = string_arg(name, &args[1])?;
            Ok(Value::Bool(s.ends_with(&suffix)))
        }
        "lower" => {
            arity(name, &args, 1)?;
            Ok(Value::String(string_arg(name, &args[0])?.to_lowercase()))
        }
        "upper" => {
            arity(name, &args, 1)?;
            Ok(Value::String(string_arg(name, &args[0])?.to_uppercase()))
        }
        "trim" => {
            arity(name, &args, 1)?;
            Ok(Value::String(string_arg(name, &args[0])?.trim().to_string()))
        }
        "replace" => {
            arity(name, &args, 3)?;
            let s = string_arg(name, &args[0])?;
            let from = string_arg(name, &args[1])?;
            let to = string_arg(name, &args[2])?;
            Ok(Value::String(s.replace(&from, &to)))
        }
        "length" => {
            arity(name, &args, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => {
                    return Err(render_err(format!(
                        "length does not apply to {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::from(len))
        }
        // index(collection, key) reaches into objects by key or arrays by
        // position; the lookup path for step ids containing dots.
        "index" => {
            arity(name, &args, 2)?;
            let value = match (&args[0], &args[1]) {
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            };
            Ok(value)
        }
        other => Err(render_err(format!("unknown function: {other}"))),
    }
}
