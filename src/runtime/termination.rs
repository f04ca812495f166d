//! Ends subtrees and whole instance chains.
//!
//! Traversal is depth-first over the in-memory tree: children before their
//! owner, siblings in creation order, a called instance before the call
//! activity that started it. Failures are collected and reported once the
//! pass is over.

use crate::runtime::agenda::Operation;
use crate::runtime::context::CommandContext;
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::EventKind;
use crate::runtime::lifecycle;
use crate::runtime::multi_instance;
use tracing::{info, warn};
use uuid::Uuid;

fn into_result(errors: Vec<EngineError>) -> EngineResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        warn!(errors = errors.len(), "Termination pass collected failures");
        Err(EngineError::Termination(errors))
    }
}

/// Cancels each execution (and its subtree) in the given order.
pub fn cancel_all(ctx: &mut CommandContext, executions: &[Uuid]) -> EngineResult<()> {
    let mut errors = Vec::new();
    for execution_id in executions {
        cancel_subtree(ctx, *execution_id, &mut errors);
    }
    into_result(errors)
}

/// Cancels one execution and everything below it.
pub fn cancel(ctx: &mut CommandContext, execution_id: Uuid) -> EngineResult<()> {
    cancel_all(ctx, &[execution_id])
}

fn cancel_subtree(ctx: &mut CommandContext, execution_id: Uuid, errors: &mut Vec<EngineError>) {
    if ctx.tree.is_ended(execution_id) {
        return;
    }
    for child in ctx.tree.live_children(execution_id) {
        cancel_subtree(ctx, child, errors);
    }
    let callee = ctx
        .tree
        .get(execution_id)
        .and_then(|e| e.sub_process_instance_id)
        .filter(|callee| !ctx.tree.is_ended(*callee));
    if let Some(callee) = callee {
        cancel_instance(ctx, callee, EventKind::ProcessCancelled, errors);
    }
    cancel_single(ctx, execution_id, errors);
}

fn cancel_contents(ctx: &mut CommandContext, scope_id: Uuid, errors: &mut Vec<EngineError>) {
    for child in ctx.tree.live_children(scope_id) {
        cancel_subtree(ctx, child, errors);
    }
}

/// Emits `ACTIVITY_CANCELLED` for an execution positioned at a node and ends it.
fn cancel_single(ctx: &mut CommandContext, execution_id: Uuid, errors: &mut Vec<EngineError>) {
    let (job_id, has_activity) = match ctx.tree.require(execution_id) {
        Ok(e) => (e.job_id, e.activity_id.is_some()),
        Err(e) => {
            errors.push(e);
            return;
        }
    };
    if let Some(job_id) = job_id {
        ctx.cancel_job(job_id);
    }
    if let Some(task_id) = ctx.tree.task_for_execution(execution_id).map(|t| t.id) {
        ctx.tree.remove_task(task_id);
    }
    if has_activity {
        let emitted = ctx
            .node_of(execution_id)
            .and_then(|node| ctx.emit_activity(EventKind::ActivityCancelled, execution_id, &node));
        if let Err(e) = emitted {
            errors.push(e);
        }
    }
    if let Err(e) = ctx.tree.end(execution_id) {
        errors.push(e);
    }
}

/// Ends an instance root after its contents, emitting `kind` for the instance.
fn cancel_instance(ctx: &mut CommandContext, instance_id: Uuid, kind: EventKind, errors: &mut Vec<EngineError>) {
    cancel_contents(ctx, instance_id, errors);
    if let Err(e) = ctx.tree.end(instance_id) {
        errors.push(e);
        return;
    }
    if let Err(e) = ctx.emit_process(kind, instance_id) {
        errors.push(e);
    }
}

/// External deletion of an instance and everything it called.
pub fn cancel_process_instance(ctx: &mut CommandContext, instance_id: Uuid) -> EngineResult<()> {
    let mut errors = Vec::new();
    cancel_instance(ctx, instance_id, EventKind::ProcessCancelled, &mut errors);
    into_result(errors)
}

/// Runs a terminate end event reached by `execution_id`.
pub fn terminate_end(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    terminate_all: bool,
    terminate_multi_instance: bool,
) -> EngineResult<()> {
    ctx.tree.end(execution_id)?;

    if terminate_all {
        let instance_id = ctx.tree.require(execution_id)?.process_instance_id;
        return terminate_instance_chain(ctx, instance_id);
    }

    if terminate_multi_instance {
        if let Some((root_id, called)) = enclosing_multi_instance_root(ctx, execution_id) {
            let mut errors = Vec::new();
            for instance_id in called {
                cancel_contents(ctx, instance_id, &mut errors);
                if let Err(e) = ctx.tree.end(instance_id) {
                    errors.push(e);
                    continue;
                }
                if let Err(e) = ctx.emit_process(EventKind::ProcessCompletedWithTerminateEvent, instance_id) {
                    errors.push(e);
                }
            }
            into_result(errors)?;
            let instances = ctx.tree.live_children(root_id);
            cancel_all(ctx, &instances)?;
            return multi_instance::finish(ctx, root_id);
        }
    }

    let scope_id = ctx
        .tree
        .nearest_scope(execution_id)
        .ok_or_else(|| EngineError::NotFound(format!("scope of execution {}", execution_id)))?;
    let mut errors = Vec::new();
    cancel_contents(ctx, scope_id, &mut errors);
    into_result(errors)?;

    if ctx.tree.require(scope_id)?.is_process_instance() {
        ctx.tree.end(scope_id)?;
        ctx.emit_process(EventKind::ProcessCompletedWithTerminateEvent, scope_id)?;
        info!(instance_id = %scope_id, "Process instance terminated");
        lifecycle::resume_caller(ctx, scope_id)
    } else {
        ctx.plan(Operation::TakeOutgoing {
            execution_id: scope_id,
            emit_completed: true,
        });
        Ok(())
    }
}

/// Terminates an instance, then every caller above it up to the top-level instance.
fn terminate_instance_chain(ctx: &mut CommandContext, instance_id: Uuid) -> EngineResult<()> {
    let mut errors = Vec::new();
    let mut current = instance_id;
    loop {
        cancel_contents(ctx, current, &mut errors);
        if let Err(e) = ctx.tree.end(current) {
            errors.push(e);
            break;
        }
        if let Err(e) = ctx.emit_process(EventKind::ProcessCompletedWithTerminateEvent, current) {
            errors.push(e);
        }
        info!(instance_id = %current, "Process instance terminated");

        let caller = ctx
            .tree
            .get(current)
            .and_then(|e| e.super_execution_id)
            .filter(|caller| !ctx.tree.is_ended(*caller));
        let Some(caller) = caller else { break };
        cancel_subtree(ctx, caller, &mut errors);
        match ctx.tree.get(caller) {
            Some(e) => current = e.process_instance_id,
            None => break,
        }
    }
    into_result(errors)
}

/// Multi-instance root whose instance contains `execution_id`.
///
/// The walk crosses from a called instance into the call activity that started
/// it; the crossed instance roots are returned innermost first.
fn enclosing_multi_instance_root(ctx: &CommandContext, execution_id: Uuid) -> Option<(Uuid, Vec<Uuid>)> {
    let mut called = Vec::new();
    let mut current = ctx.tree.get(execution_id)?.parent_id;
    while let Some(candidate) = current {
        if let Some(root_id) = ctx.tree.multi_instance_root_of(candidate) {
            return Some((root_id, called));
        }
        let execution = ctx.tree.get(candidate)?;
        current = match execution.parent_id {
            Some(parent_id) => Some(parent_id),
            None => {
                called.push(candidate);
                execution.super_execution_id
            }
        };
    }
    None
}
