use crate::handlers::{FatalError, HandlerContext};
use crate::runtime::agenda::Operation;
use crate::runtime::context::CommandContext;
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::EventKind;
use crate::runtime::graph::{FlowNode, ServiceTaskConfig};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error};
use uuid::Uuid;

// --- USER TASK ---

/// Creates the task entity and waits for `complete_task`.
pub fn user_task(ctx: &mut CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
    let name = node.name.as_ref().map(|template| {
        let scope = ctx.tree.visible_variables(execution_id);
        ctx.services.resolver.resolve_template(template, &scope)
    });
    let task = ctx.tree.add_task(execution_id, &node.id, name)?;
    debug!(task_id = %task.id, activity_id = %node.id, "User task created");
    ctx.emit_task(EventKind::EntityCreated, &task, node)
}

// --- SERVICE TASK ---

/// Resolves `${...}` placeholders inside string parameters. A parameter that is
/// exactly one placeholder keeps the evaluated value's type.
fn resolve_params(
    ctx: &CommandContext,
    params: &std::collections::HashMap<String, Value>,
    scope: &BTreeMap<String, Value>,
) -> EngineResult<Value> {
    let mut resolved = serde_json::Map::new();
    for (key, value) in params {
        let value = match value {
            Value::String(s) if s.starts_with("${") && s.ends_with('}') && s.matches("${").count() == 1 => {
                ctx.services.resolver.evaluate(s, scope)?
            }
            Value::String(s) if s.contains("${") => Value::String(ctx.services.resolver.resolve_template(s, scope)),
            other => other.clone(),
        };
        resolved.insert(key.clone(), value);
    }
    Ok(Value::Object(resolved))
}

/// Runs a registered handler synchronously, stores its result and moves on.
pub fn service_task(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    node: &FlowNode,
    config: &ServiceTaskConfig,
) -> EngineResult<()> {
    let handler = ctx
        .services
        .handlers
        .get(&config.handler)
        .ok_or_else(|| EngineError::config(format!("handler '{}' is not registered", config.handler)))?;

    let scope = ctx.tree.visible_variables(execution_id);
    let params = resolve_params(ctx, &config.params, &scope)?;
    let mut handler_ctx = HandlerContext::new(execution_id, &node.id, &scope);

    let result = match handler.execute(params, &mut handler_ctx) {
        Ok(value) => value,
        Err(e) => {
            error!(activity_id = %node.id, handler = %config.handler, "Handler failed: {:#}", e);
            if let Some(fatal) = e.downcast_ref::<FatalError>() {
                return Err(EngineError::Fatal {
                    activity_id: node.id.clone(),
                    message: fatal.0.clone(),
                });
            }
            return Err(EngineError::Behavior {
                activity_id: node.id.clone(),
                source: e,
            });
        }
    };

    for (name, value) in handler_ctx.into_updates() {
        ctx.tree.set_variable(execution_id, &name, value)?;
    }
    if let Some(output) = &config.output {
        ctx.tree.set_variable(execution_id, output, result)?;
    }
    ctx.plan(Operation::TakeOutgoing {
        execution_id,
        emit_completed: true,
    });
    Ok(())
}
