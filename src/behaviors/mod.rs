//! Control-flow logic per node kind, dispatched by `match` over [`NodeKind`].

pub mod action;
pub mod common;
pub mod flow;
pub mod scope;

use crate::runtime::context::CommandContext;
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::graph::{EndEventKind, FlowNode, NodeKind};
use uuid::Uuid;

/// Runs the behavior of `node` for an execution that just became active.
pub fn execute(ctx: &mut CommandContext, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
    match &node.kind {
        NodeKind::StartEvent => common::start_event(ctx, execution_id),
        NodeKind::EndEvent(EndEventKind::None) => common::none_end_event(ctx, execution_id, node),
        NodeKind::EndEvent(EndEventKind::Terminate {
            terminate_all,
            terminate_multi_instance,
        }) => common::terminate_end_event(ctx, execution_id, *terminate_all, *terminate_multi_instance),
        NodeKind::UserTask => action::user_task(ctx, execution_id, node),
        NodeKind::ServiceTask(config) => action::service_task(ctx, execution_id, node, config),
        NodeKind::ExclusiveGateway { default_target } => {
            flow::exclusive_gateway(ctx, execution_id, node, default_target.as_deref())
        }
        NodeKind::ParallelGateway => flow::parallel_gateway(ctx, execution_id, node),
        NodeKind::SubProcess => scope::sub_process(ctx, execution_id, node),
        NodeKind::CallActivity { called_element } => scope::call_activity(ctx, execution_id, called_element),
        NodeKind::IntermediateCatchEvent { trigger } => common::catch_event(ctx, execution_id, node, trigger),
        NodeKind::BoundaryEvent { .. } => Err(EngineError::config(format!(
            "boundary event '{}' cannot be entered through a sequence flow",
            node.id
        ))),
    }
}

/// Delivers a timer or message to a waiting execution.
pub fn trigger(ctx: &mut CommandContext, execution_id: Uuid) -> EngineResult<()> {
    let node = ctx.node_of(execution_id)?;
    match &node.kind {
        NodeKind::BoundaryEvent {
            trigger,
            cancel_activity,
            ..
        } => common::fire_boundary(ctx, execution_id, &node, trigger, *cancel_activity),
        NodeKind::IntermediateCatchEvent { .. } => common::resume_catch_event(ctx, execution_id),
        _ => Err(EngineError::config(format!("node '{}' does not accept triggers", node.id))),
    }
}
