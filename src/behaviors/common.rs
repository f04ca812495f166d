use crate::runtime::agenda::Operation;
use crate::runtime::context::CommandContext;
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::EventKind;
use crate::runtime::graph::{EventTrigger, FlowNode};
use crate::runtime::lifecycle;
use crate::runtime::termination;
use tracing::debug;
use uuid::Uuid;

// --- START / END ---

pub fn start_event(ctx: &mut CommandContext, execution_id: Uuid) -> EngineResult<()> {
    ctx.plan(Operation::TakeOutgoing {
        execution_id,
        emit_completed: true,
    });
    Ok(())
}

pub fn none_end_event(ctx: &mut CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
    ctx.emit_activity(EventKind::ActivityCompleted, execution_id, node)?;
    lifecycle::complete_execution(ctx, execution_id)
}

pub fn terminate_end_event(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    terminate_all: bool,
    terminate_multi_instance: bool,
) -> EngineResult<()> {
    debug!(execution_id = %execution_id, terminate_all, terminate_multi_instance, "Terminate end event reached");
    termination::terminate_end(ctx, execution_id, terminate_all, terminate_multi_instance)
}

// --- CATCH EVENTS ---

pub fn catch_event(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    node: &FlowNode,
    trigger: &EventTrigger,
) -> EngineResult<()> {
    ctx.subscribe(execution_id, &node.id, trigger)
}

pub fn resume_catch_event(ctx: &mut CommandContext, execution_id: Uuid) -> EngineResult<()> {
    let execution = ctx.tree.require_mut(execution_id)?;
    execution.job_id = None;
    execution.message_subscription = None;
    ctx.plan(Operation::TakeOutgoing {
        execution_id,
        emit_completed: true,
    });
    Ok(())
}

// --- BOUNDARY EVENTS ---

/// A boundary event fired. Interrupting boundaries cancel the attached
/// execution first; non-interrupting ones fork a new token.
pub fn fire_boundary(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    node: &FlowNode,
    trigger: &EventTrigger,
    cancel_activity: bool,
) -> EngineResult<()> {
    let attached = ctx
        .tree
        .require(execution_id)?
        .boundary_of
        .ok_or_else(|| EngineError::config(format!("boundary execution {} is not attached", execution_id)))?;

    if cancel_activity {
        lifecycle::discard_boundaries(ctx, attached, Some(execution_id))?;
        termination::cancel(ctx, attached)?;
        {
            let execution = ctx.tree.require_mut(execution_id)?;
            execution.boundary_of = None;
            execution.job_id = None;
            execution.message_subscription = None;
        }
        ctx.emit_activity(EventKind::ActivityCompleted, execution_id, node)?;
        return lifecycle::leave(ctx, execution_id, node, None);
    }

    let parent_id = ctx
        .tree
        .require(execution_id)?
        .parent_id
        .ok_or_else(|| EngineError::config(format!("boundary execution {} has no parent", execution_id)))?;
    let token = ctx.tree.create_child(parent_id)?;
    {
        let execution = ctx.tree.require_mut(token)?;
        execution.activity_id = Some(node.id.clone());
        execution.is_concurrent = true;
    }
    if matches!(trigger, EventTrigger::Timer { .. }) {
        ctx.tree.end(execution_id)?;
    }
    ctx.emit_activity(EventKind::ActivityCompleted, token, node)?;
    lifecycle::leave(ctx, token, node, None)
}
