use crate::runtime::context::CommandContext;
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::EventKind;
use crate::runtime::graph::FlowNode;
use crate::runtime::lifecycle;
use tracing::debug;
use uuid::Uuid;

// --- EXCLUSIVE GATEWAY ---

/// Takes the first outgoing flow whose condition holds, else the default flow.
pub fn exclusive_gateway(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    node: &FlowNode,
    default_target: Option<&str>,
) -> EngineResult<()> {
    let scope = ctx.tree.visible_variables(execution_id);
    let mut chosen = None;
    for flow in &node.outgoing {
        if Some(flow.target.as_str()) == default_target {
            continue;
        }
        let taken = match &flow.condition {
            Some(condition) => ctx.services.resolver.evaluate_bool(condition, &scope)?,
            None => true,
        };
        if taken {
            chosen = Some(flow.target.clone());
            break;
        }
    }
    let target = chosen
        .or_else(|| default_target.map(str::to_string))
        .ok_or_else(|| EngineError::Behavior {
            activity_id: node.id.clone(),
            source: anyhow::anyhow!("no outgoing sequence flow could be selected"),
        })?;

    debug!(gateway = %node.id, target = %target, "Exclusive gateway decision");
    ctx.emit_activity(EventKind::ActivityCompleted, execution_id, node)?;
    lifecycle::leave(ctx, execution_id, node, Some(vec![target]))
}

// --- PARALLEL GATEWAY ---

/// Fork when there is a single incoming flow; otherwise park the token until
/// one token per incoming flow has arrived, then continue with a single one.
pub fn parallel_gateway(ctx: &mut CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
    let graph = ctx.graph_of(execution_id)?;
    let expected = graph.incoming_count(&node.id);
    if expected <= 1 {
        ctx.emit_activity(EventKind::ActivityCompleted, execution_id, node)?;
        return lifecycle::leave(ctx, execution_id, node, None);
    }

    ctx.tree.require_mut(execution_id)?.is_active = false;
    let parent_id = ctx
        .tree
        .require(execution_id)?
        .parent_id
        .ok_or_else(|| EngineError::config(format!("join '{}' reached by an instance root", node.id)))?;
    let waiting: Vec<Uuid> = ctx
        .tree
        .live_children(parent_id)
        .into_iter()
        .filter(|id| {
            ctx.tree
                .get(*id)
                .is_some_and(|e| !e.is_active && e.activity_id.as_deref() == Some(node.id.as_str()))
        })
        .collect();
    if waiting.len() < expected {
        debug!(gateway = %node.id, arrived = waiting.len(), expected, "Join waiting");
        return Ok(());
    }

    for other in waiting.iter().filter(|id| **id != execution_id).take(expected - 1) {
        ctx.tree.end(*other)?;
    }
    let single_token = ctx.tree.live_children(parent_id).len() == 1;
    {
        let execution = ctx.tree.require_mut(execution_id)?;
        execution.is_active = true;
        if single_token {
            execution.is_concurrent = false;
        }
    }
    ctx.emit_activity(EventKind::ActivityCompleted, execution_id, node)?;
    lifecycle::leave(ctx, execution_id, node, None)
}
