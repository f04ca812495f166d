//! Activity lifecycle: entering nodes, leaving them, and completing scopes.
//!
//! Every function here runs inside one [`CommandContext`]; nothing is persisted
//! until the whole command has drained its agenda.

use crate::behaviors;
use crate::runtime::agenda::Operation;
use crate::runtime::context::{CommandContext, CommandOutcome};
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::EventKind;
use crate::runtime::graph::{FlowNode, NodeKind};
use crate::runtime::multi_instance;
use crate::runtime::storage::TimerJob;
use crate::runtime::termination;
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

pub fn execute_operation(ctx: &mut CommandContext, operation: Operation) -> EngineResult<()> {
    match operation {
        Operation::Continue(execution_id) => continue_execution(ctx, execution_id),
        Operation::TakeOutgoing {
            execution_id,
            emit_completed,
        } => take_outgoing(ctx, execution_id, emit_completed),
    }
}

fn continue_execution(ctx: &mut CommandContext, execution_id: Uuid) -> EngineResult<()> {
    if ctx.tree.is_ended(execution_id) {
        return Ok(());
    }
    let node = ctx.node_of(execution_id)?;
    let is_instance = ctx.tree.multi_instance_root_of(execution_id).is_some();
    if !is_instance {
        arm_boundaries(ctx, execution_id, &node)?;
        if node.multi_instance.is_some() {
            return multi_instance::enter(ctx, execution_id, &node);
        }
    }
    start(ctx, execution_id, &node)
}

/// CREATED -> ACTIVE: emits `ACTIVITY_STARTED` and runs the node behavior.
pub fn start(ctx: &mut CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
    ctx.tree.require_mut(execution_id)?.is_active = true;
    ctx.emit_activity(EventKind::ActivityStarted, execution_id, node)?;
    behaviors::execute(ctx, execution_id, node)
}

/// Creates one waiting execution per boundary event, as siblings of the attached one.
fn arm_boundaries(ctx: &mut CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
    if node.boundaries.is_empty() {
        return Ok(());
    }
    let graph = ctx.graph_of(execution_id)?;
    let parent_id = ctx
        .tree
        .require(execution_id)?
        .parent_id
        .ok_or_else(|| EngineError::config(format!("boundary events on instance root of '{}'", node.id)))?;
    for boundary_id in &node.boundaries {
        let boundary = graph
            .node(boundary_id)
            .ok_or_else(|| EngineError::config(format!("unknown boundary event '{}'", boundary_id)))?;
        let NodeKind::BoundaryEvent { trigger, .. } = &boundary.kind else {
            return Err(EngineError::config(format!("'{}' is not a boundary event", boundary_id)));
        };
        let boundary_execution = ctx.tree.create_child(parent_id)?;
        {
            let execution = ctx.tree.require_mut(boundary_execution)?;
            execution.activity_id = Some(boundary_id.clone());
            execution.boundary_of = Some(execution_id);
            execution.is_concurrent = true;
        }
        ctx.tree.require_mut(execution_id)?.is_concurrent = true;
        ctx.subscribe(boundary_execution, boundary_id, trigger)?;
    }
    Ok(())
}

/// Silently ends the boundary executions attached to `execution_id`.
pub fn discard_boundaries(ctx: &mut CommandContext, execution_id: Uuid, keep: Option<Uuid>) -> EngineResult<()> {
    let Some(parent_id) = ctx.tree.require(execution_id)?.parent_id else {
        return Ok(());
    };
    let attached: Vec<Uuid> = ctx
        .tree
        .live_children(parent_id)
        .into_iter()
        .filter(|c| Some(*c) != keep)
        .filter(|c| ctx.tree.get(*c).is_some_and(|e| e.boundary_of == Some(execution_id)))
        .collect();
    for boundary_execution in attached {
        if let Some(job_id) = ctx.tree.require(boundary_execution)?.job_id {
            ctx.cancel_job(job_id);
        }
        ctx.tree.end(boundary_execution)?;
    }
    Ok(())
}

fn take_outgoing(ctx: &mut CommandContext, execution_id: Uuid, emit_completed: bool) -> EngineResult<()> {
    if ctx.tree.is_ended(execution_id) {
        return Ok(());
    }
    if let Some(root_id) = ctx.tree.multi_instance_root_of(execution_id) {
        return multi_instance::instance_completed(ctx, root_id, execution_id, emit_completed);
    }
    let node = ctx.node_of(execution_id)?;
    if emit_completed {
        ctx.emit_activity(EventKind::ActivityCompleted, execution_id, &node)?;
    }
    leave(ctx, execution_id, &node, None)
}

/// Moves the token past `node`. With `targets` the given successors are used,
/// otherwise every outgoing flow whose condition holds.
pub fn leave(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    node: &FlowNode,
    targets: Option<Vec<String>>,
) -> EngineResult<()> {
    discard_boundaries(ctx, execution_id, None)?;
    {
        let execution = ctx.tree.require_mut(execution_id)?;
        execution.is_scope = false;
        execution.is_active = true;
    }
    let targets = match targets {
        Some(targets) => targets,
        None => outgoing_targets(ctx, execution_id, node)?,
    };
    if targets.is_empty() {
        return complete_execution(ctx, execution_id);
    }

    let parent_id = ctx.tree.require(execution_id)?.parent_id;
    let concurrent = targets.len() > 1;
    for (index, target) in targets.into_iter().enumerate() {
        let token = if index == 0 {
            execution_id
        } else {
            let parent_id = parent_id
                .ok_or_else(|| EngineError::config(format!("cannot split at instance root ('{}')", node.id)))?;
            ctx.tree.create_child(parent_id)?
        };
        let execution = ctx.tree.require_mut(token)?;
        execution.activity_id = Some(target);
        execution.is_concurrent |= concurrent;
        ctx.plan(Operation::Continue(token));
    }
    Ok(())
}

fn outgoing_targets(ctx: &CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<Vec<String>> {
    let mut targets = Vec::with_capacity(node.outgoing.len());
    let unconditional = matches!(node.kind, NodeKind::ParallelGateway);
    let mut scope = None;
    for flow in &node.outgoing {
        let taken = match &flow.condition {
            Some(condition) if !unconditional => {
                let vars = scope.get_or_insert_with(|| ctx.tree.visible_variables(execution_id));
                ctx.services.resolver.evaluate_bool(condition, vars)?
            }
            _ => true,
        };
        if taken {
            targets.push(flow.target.clone());
        }
    }
    Ok(targets)
}

/// Ends a token that has nowhere left to go and completes its scope if it was the last one.
pub fn complete_execution(ctx: &mut CommandContext, execution_id: Uuid) -> EngineResult<()> {
    ctx.tree.end(execution_id)?;
    match ctx.tree.require(execution_id)?.parent_id {
        Some(parent_id) => propagate_completion(ctx, parent_id),
        None => Ok(()),
    }
}

/// A parallel scope completes once all of its children have ended.
pub fn propagate_completion(ctx: &mut CommandContext, scope_id: Uuid) -> EngineResult<()> {
    if !ctx.tree.live_children(scope_id).is_empty() {
        return Ok(());
    }
    let scope = ctx.tree.require(scope_id)?;
    if scope.is_ended || scope.is_multi_instance_root {
        return Ok(());
    }
    if scope.is_process_instance() {
        complete_process_instance(ctx, scope_id)
    } else {
        ctx.plan(Operation::TakeOutgoing {
            execution_id: scope_id,
            emit_completed: true,
        });
        Ok(())
    }
}

fn complete_process_instance(ctx: &mut CommandContext, instance_id: Uuid) -> EngineResult<()> {
    ctx.tree.end(instance_id)?;
    ctx.emit_process(EventKind::ProcessCompleted, instance_id)?;
    info!(instance_id = %instance_id, "Process instance completed");
    resume_caller(ctx, instance_id)
}

/// Continues the caller's call activity once a called instance has ended.
pub fn resume_caller(ctx: &mut CommandContext, instance_id: Uuid) -> EngineResult<()> {
    if let Some(caller) = ctx.tree.require(instance_id)?.super_execution_id {
        if !ctx.tree.is_ended(caller) {
            ctx.plan(Operation::TakeOutgoing {
                execution_id: caller,
                emit_completed: true,
            });
        }
    }
    Ok(())
}

// --- Commands ---

pub fn start_process_instance(
    ctx: &mut CommandContext,
    process_key: &str,
    variables: HashMap<String, Value>,
) -> EngineResult<Uuid> {
    let graph = ctx.graph(process_key)?;
    let instance_id = ctx.tree.create_process_instance(&graph.key, None)?;
    for (name, value) in variables {
        ctx.tree.set_local_variable(instance_id, &name, value)?;
    }
    ctx.emit_process(EventKind::ProcessStarted, instance_id)?;
    let start_execution = ctx.tree.create_child(instance_id)?;
    ctx.tree.require_mut(start_execution)?.activity_id = Some(graph.start_event.clone());
    ctx.plan(Operation::Continue(start_execution));
    info!(instance_id = %instance_id, process_key = %process_key, "Process instance started");
    Ok(instance_id)
}

pub fn complete_task(
    ctx: &mut CommandContext,
    task_id: Uuid,
    variables: HashMap<String, Value>,
) -> EngineResult<CommandOutcome> {
    let Some(task) = ctx.tree.task(task_id).cloned() else {
        return Ok(CommandOutcome::AlreadyHandled);
    };
    if ctx.tree.is_ended(task.execution_id) {
        return Ok(CommandOutcome::AlreadyHandled);
    }
    for (name, value) in variables {
        ctx.tree.set_variable(task.execution_id, &name, value)?;
    }
    let node = ctx.node_of(task.execution_id)?;
    ctx.tree.remove_task(task_id);
    ctx.emit_task(EventKind::EntityCompleted, &task, &node)?;
    ctx.plan(Operation::TakeOutgoing {
        execution_id: task.execution_id,
        emit_completed: true,
    });
    Ok(CommandOutcome::Applied)
}

pub fn fire_timer(ctx: &mut CommandContext, job: &TimerJob) -> EngineResult<CommandOutcome> {
    let Some(execution) = ctx.tree.get(job.execution_id) else {
        return Ok(CommandOutcome::AlreadyHandled);
    };
    if execution.is_ended || execution.job_id != Some(job.id) {
        return Ok(CommandOutcome::AlreadyHandled);
    }
    ctx.tree.require_mut(job.execution_id)?.job_id = None;
    ctx.cancel_job(job.id);
    behaviors::trigger(ctx, job.execution_id)?;
    Ok(CommandOutcome::Applied)
}

pub fn deliver_message(ctx: &mut CommandContext, message: &str, execution_id: Uuid) -> EngineResult<CommandOutcome> {
    let Some(execution) = ctx.tree.get(execution_id) else {
        return Ok(CommandOutcome::AlreadyHandled);
    };
    if execution.is_ended || execution.message_subscription.as_deref() != Some(message) {
        return Ok(CommandOutcome::AlreadyHandled);
    }
    behaviors::trigger(ctx, execution_id)?;
    Ok(CommandOutcome::Applied)
}

pub fn cancel_process_instance(ctx: &mut CommandContext, instance_id: Uuid) -> EngineResult<CommandOutcome> {
    if ctx.tree.is_ended(instance_id) {
        return Ok(CommandOutcome::AlreadyHandled);
    }
    termination::cancel_process_instance(ctx, instance_id)?;
    info!(instance_id = %instance_id, "Process instance cancelled");
    Ok(CommandOutcome::Applied)
}
