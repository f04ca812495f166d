use crate::runtime::agenda::Operation;
use crate::runtime::context::CommandContext;
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::EventKind;
use crate::runtime::graph::FlowNode;
use tracing::info;
use uuid::Uuid;

/// The execution becomes the sub-process scope and a child enters its start event.
pub fn sub_process(ctx: &mut CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
    let graph = ctx.graph_of(execution_id)?;
    let start = graph
        .start_of(Some(&node.id))
        .ok_or_else(|| EngineError::config(format!("sub-process '{}' has no start event", node.id)))?;

    ctx.tree.require_mut(execution_id)?.is_scope = true;
    let child = ctx.tree.create_child(execution_id)?;
    ctx.tree.require_mut(child)?.activity_id = Some(start.id.clone());
    ctx.plan(Operation::Continue(child));
    Ok(())
}

/// Starts a called instance inside the same tree. Visible variables are copied in;
/// the call activity waits until the called instance ends.
pub fn call_activity(ctx: &mut CommandContext, execution_id: Uuid, called_element: &str) -> EngineResult<()> {
    let called = ctx.graph(called_element)?;
    let variables = ctx.tree.visible_variables(execution_id);

    let callee = ctx.tree.create_process_instance(&called.key, Some(execution_id))?;
    for (name, value) in variables {
        ctx.tree.set_local_variable(callee, &name, value)?;
    }
    ctx.emit_process(EventKind::ProcessStarted, callee)?;
    info!(caller = %execution_id, instance_id = %callee, process_key = %called.key, "Called instance started");

    let start = ctx.tree.create_child(callee)?;
    ctx.tree.require_mut(start)?.activity_id = Some(called.start_event.clone());
    ctx.plan(Operation::Continue(start));
    Ok(())
}
