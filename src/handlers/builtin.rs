use crate::handlers::{HandlerContext, ServiceHandler};
use crate::runtime::expression::{EvalExprResolver, ExpressionResolver};
use anyhow::{Result, anyhow};
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

/// Writes `msg` (or the whole parameter object) to the log.
#[derive(Debug)]
pub struct LogHandler;

impl ServiceHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn execute(&self, params: Value, ctx: &mut HandlerContext) -> Result<Value> {
        if let Some(msg) = params.get("msg").and_then(|v| v.as_str()) {
            info!(activity_id = %ctx.activity_id, "[LOG] {}", msg);
        } else {
            info!(activity_id = %ctx.activity_id, "[LOG] {:?}", params);
        }
        Ok(Value::Null)
    }
}

/// Sets variables.
///
/// - `assignments`: list of `{ key, value }` pairs written as-is.
/// - `expression`: `name = expr`, evaluated against the visible variables.
/// - `value`: returned as the task result (stored in the task's `output`).
#[derive(Debug)]
pub struct AssignHandler;

impl ServiceHandler for AssignHandler {
    fn name(&self) -> &str {
        "assign"
    }

    fn validate(&self, params: &HashMap<String, Value>) -> Result<()> {
        if let Some(expr) = params.get("expression") {
            let expr = expr.as_str().ok_or_else(|| anyhow!("'expression' must be a string"))?;
            if !expr.contains('=') {
                return Err(anyhow!("'expression' must have the form `name = expr`"));
            }
        }
        Ok(())
    }

    fn execute(&self, params: Value, ctx: &mut HandlerContext) -> Result<Value> {
        if let Some(list) = params.get("assignments").and_then(|v| v.as_array()) {
            for item in list {
                if let (Some(k), Some(v)) = (item.get("key").and_then(|s| s.as_str()), item.get("value")) {
                    ctx.set_var(k, v.clone());
                }
            }
        }

        if let Some(expr) = params.get("expression").and_then(|v| v.as_str()) {
            let (target, rhs) = expr
                .split_once('=')
                .map(|(l, r)| (l.trim(), r.trim()))
                .ok_or_else(|| anyhow!("expression '{}' has no assignment", expr))?;
            let value = EvalExprResolver::new().evaluate(rhs, &ctx.vars())?;
            ctx.set_var(target, value);
        }

        Ok(params.get("value").cloned().unwrap_or(Value::Null))
    }
}
