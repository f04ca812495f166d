use crate::runtime::agenda::Operation;
use crate::runtime::context::CommandContext;
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::EventKind;
use crate::runtime::execution::LOOP_COUNTER;
use crate::runtime::expression::strip_placeholder;
use crate::runtime::graph::{FlowNode, MultiInstanceConfig};
use crate::runtime::termination;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";

/// Fan-out: the arriving execution becomes the multi-instance root and the
/// first (sequential) or all (parallel) instances are planned.
pub fn enter(ctx: &mut CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
    let config = config_of(node)?;
    let scope = ctx.tree.visible_variables(execution_id);
    let instances = resolve_instances(ctx, config, &scope, &node.id)?;
    let count = instances.count;

    {
        let root = ctx.tree.require_mut(execution_id)?;
        root.is_multi_instance_root = true;
        root.is_scope = true;
        root.is_active = false;
    }
    ctx.emit_activity(EventKind::ActivityStarted, execution_id, node)?;

    let active = if config.sequential { count.min(1) } else { count };
    ctx.tree.set_local_variable(execution_id, NR_OF_INSTANCES, json!(count))?;
    ctx.tree.set_local_variable(execution_id, NR_OF_COMPLETED_INSTANCES, json!(0))?;
    ctx.tree.set_local_variable(execution_id, NR_OF_ACTIVE_INSTANCES, json!(active))?;
    debug!(activity_id = %node.id, instances = count, sequential = config.sequential, "Multi-instance fan-out");

    if count == 0 {
        return finish(ctx, execution_id);
    }
    let spawned = if config.sequential { 1 } else { count };
    for index in 0..spawned {
        spawn_instance(ctx, execution_id, node, index, instances.element(index))?;
    }
    Ok(())
}

fn config_of(node: &FlowNode) -> EngineResult<&MultiInstanceConfig> {
    node.multi_instance
        .as_ref()
        .ok_or_else(|| EngineError::config(format!("'{}' is not a multi-instance activity", node.id)))
}

/// Number of instances, plus the collection elements when iterating one.
struct Instances {
    count: usize,
    elements: Vec<Value>,
}

impl Instances {
    fn element(&self, index: usize) -> Option<Value> {
        self.elements.get(index).cloned()
    }
}

fn resolve_instances(
    ctx: &CommandContext,
    config: &MultiInstanceConfig,
    scope: &BTreeMap<String, Value>,
    activity_id: &str,
) -> EngineResult<Instances> {
    let limit = ctx.services.config.max_operations_per_command;
    if let Some(collection) = &config.collection {
        let name = strip_placeholder(collection);
        let items = match scope.get(name) {
            Some(Value::Array(items)) => items,
            other => {
                return Err(EngineError::config(format!(
                    "collection '{}' of '{}' is not an array: {:?}",
                    name, activity_id, other
                )));
            }
        };
        if items.len() > limit {
            return Err(EngineError::config(format!(
                "collection '{}' of '{}' has {} elements, more than the limit of {}",
                name,
                activity_id,
                items.len(),
                limit
            )));
        }
        return Ok(Instances {
            count: items.len(),
            elements: items.clone(),
        });
    }
    let expression = config
        .cardinality
        .as_deref()
        .ok_or_else(|| EngineError::config(format!("'{}' has neither cardinality nor collection", activity_id)))?;
    let value = ctx
        .services
        .resolver
        .evaluate(expression, scope)
        .map_err(|e| EngineError::config(format!("cardinality of '{}': {}", activity_id, e)))?;
    let count = match &value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let count = match count.and_then(|n| usize::try_from(n).ok()) {
        Some(count) => count,
        None => {
            return Err(EngineError::config(format!(
                "cardinality of '{}' must be a non-negative integer, got {}",
                activity_id, value
            )));
        }
    };
    // Each instance costs at least one agenda operation.
    if count > limit {
        return Err(EngineError::config(format!(
            "cardinality {} of '{}' exceeds the limit of {} instances",
            count, activity_id, limit
        )));
    }
    Ok(Instances {
        count,
        elements: Vec::new(),
    })
}

fn spawn_instance(
    ctx: &mut CommandContext,
    root_id: Uuid,
    node: &FlowNode,
    index: usize,
    element: Option<Value>,
) -> EngineResult<Uuid> {
    let sequential = config_of(node)?.sequential;
    let element_variable = config_of(node)?.element_variable.clone();
    let child = ctx.tree.create_child(root_id)?;
    {
        let execution = ctx.tree.require_mut(child)?;
        execution.activity_id = Some(node.id.clone());
        execution.is_concurrent = !sequential;
    }
    ctx.tree.set_local_variable(child, LOOP_COUNTER, json!(index))?;
    if let (Some(name), Some(element)) = (element_variable, element) {
        ctx.tree.set_local_variable(child, &name, element)?;
    }
    ctx.plan(Operation::Continue(child));
    Ok(child)
}

fn counter(ctx: &CommandContext, root_id: Uuid, name: &str) -> usize {
    ctx.tree
        .get(root_id)
        .and_then(|e| e.variables.get(name))
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

/// Fan-in bookkeeping after one instance left the activity.
pub fn instance_completed(
    ctx: &mut CommandContext,
    root_id: Uuid,
    instance_id: Uuid,
    emit_completed: bool,
) -> EngineResult<()> {
    let node = ctx.node_of(instance_id)?;
    let config = config_of(&node)?.clone();
    if emit_completed {
        ctx.emit_activity(EventKind::ActivityCompleted, instance_id, &node)?;
    }
    ctx.tree.end(instance_id)?;

    let total = counter(ctx, root_id, NR_OF_INSTANCES);
    let completed = counter(ctx, root_id, NR_OF_COMPLETED_INSTANCES) + 1;
    let active = if config.sequential {
        0
    } else {
        counter(ctx, root_id, NR_OF_ACTIVE_INSTANCES).saturating_sub(1)
    };
    ctx.tree.set_local_variable(root_id, NR_OF_COMPLETED_INSTANCES, json!(completed))?;
    ctx.tree.set_local_variable(root_id, NR_OF_ACTIVE_INSTANCES, json!(active))?;

    if let Some(condition) = &config.completion_condition {
        let scope = ctx.tree.visible_variables(instance_id);
        if ctx.services.resolver.evaluate_bool(condition, &scope)? {
            debug!(activity_id = %node.id, completed, "Completion condition reached");
            let mut remaining = ctx.tree.live_children(root_id);
            remaining.sort_by_key(|id| ctx.tree.get(*id).and_then(|e| e.loop_counter()));
            termination::cancel_all(ctx, &remaining)?;
            return finish(ctx, root_id);
        }
    }

    if completed >= total {
        return finish(ctx, root_id);
    }
    if config.sequential {
        ctx.tree.set_local_variable(root_id, NR_OF_ACTIVE_INSTANCES, json!(1))?;
        let element = sequential_element(ctx, &config, root_id, completed)?;
        spawn_instance(ctx, root_id, &node, completed, element)?;
    }
    Ok(())
}

fn sequential_element(
    ctx: &CommandContext,
    config: &MultiInstanceConfig,
    root_id: Uuid,
    index: usize,
) -> EngineResult<Option<Value>> {
    let Some(collection) = &config.collection else {
        return Ok(None);
    };
    let name = strip_placeholder(collection);
    Ok(ctx
        .tree
        .get_variable(root_id, name)
        .and_then(Value::as_array)
        .and_then(|items| items.get(index))
        .cloned())
}

/// Ends the multi-instance role of the root and moves it past the activity.
pub fn finish(ctx: &mut CommandContext, root_id: Uuid) -> EngineResult<()> {
    let root = ctx.tree.require_mut(root_id)?;
    root.is_multi_instance_root = false;
    root.is_scope = false;
    root.is_active = true;
    for name in [NR_OF_INSTANCES, NR_OF_ACTIVE_INSTANCES, NR_OF_COMPLETED_INSTANCES] {
        root.variables.remove(name);
    }
    ctx.plan(Operation::TakeOutgoing {
        execution_id: root_id,
        emit_completed: true,
    });
    Ok(())
}
