use crate::runtime::error::{EngineError, EngineResult};
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::debug;

/// Evaluates expressions against the variables visible from an execution.
pub trait ExpressionResolver: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &BTreeMap<String, Value>) -> EngineResult<Value>;

    fn evaluate_bool(&self, expression: &str, scope: &BTreeMap<String, Value>) -> EngineResult<bool> {
        match self.evaluate(expression, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::Expression {
                expression: expression.to_string(),
                message: format!("expected a boolean, got {}", other),
            }),
        }
    }

    /// Replaces every `${...}` placeholder in `template`. Placeholders that fail
    /// to evaluate are left untouched.
    fn resolve_template(&self, template: &str, scope: &BTreeMap<String, Value>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            let Some(len) = rest[start..].find('}') else { break };
            out.push_str(&rest[..start]);
            let placeholder = &rest[start..start + len + 1];
            match self.evaluate(placeholder, scope) {
                Ok(Value::String(s)) => out.push_str(&s),
                Ok(value) => out.push_str(&value.to_string()),
                Err(e) => {
                    debug!("Leaving placeholder {} unresolved: {}", placeholder, e);
                    out.push_str(placeholder);
                }
            }
            rest = &rest[start + len + 1..];
        }
        out.push_str(rest);
        out
    }
}

/// [`ExpressionResolver`] backed by `evalexpr`. Accepts both `${expr}` and bare `expr`.
#[derive(Debug, Default, Clone)]
pub struct EvalExprResolver;

impl EvalExprResolver {
    pub fn new() -> Self {
        Self
    }
}

pub fn strip_placeholder(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn to_eval_value(value: &Value) -> Option<evalexpr::Value> {
    match value {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(evalexpr::Value::Int(i))
            } else {
                n.as_f64().map(evalexpr::Value::Float)
            }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        Value::Array(items) => Some(evalexpr::Value::Tuple(
            items.iter().filter_map(to_eval_value).collect(),
        )),
        Value::Null => Some(evalexpr::Value::Empty),
        Value::Object(_) => None,
    }
}

fn to_json_value(value: evalexpr::Value) -> Value {
    match value {
        evalexpr::Value::String(s) => Value::String(s),
        evalexpr::Value::Int(i) => json!(i),
        evalexpr::Value::Float(f) => json!(f),
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        evalexpr::Value::Tuple(items) => Value::Array(items.into_iter().map(to_json_value).collect()),
        evalexpr::Value::Empty => Value::Null,
    }
}

impl ExpressionResolver for EvalExprResolver {
    fn evaluate(&self, expression: &str, scope: &BTreeMap<String, Value>) -> EngineResult<Value> {
        let source = strip_placeholder(expression);
        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        for (k, v) in scope {
            if let Some(ev) = to_eval_value(v) {
                let _ = eval_ctx.set_value(k.clone(), ev);
            }
        }
        eval_with_context(source, &eval_ctx)
            .map(to_json_value)
            .map_err(|e| EngineError::Expression {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }
}
