use crate::dsl::{Flow, MultiInstance, Node, NodeType, ProcessDefinition};
use crate::handlers::HandlerRegistry;
use crate::runtime::graph::{
    EndEventKind, EventTrigger, FlowNode, MultiInstanceConfig, NodeKind, ProcessGraph, SequenceFlow,
    ServiceTaskConfig,
};
use anyhow::{Result, anyhow, bail};
use std::collections::HashMap;

/// Turns an authored [`ProcessDefinition`] into a validated [`ProcessGraph`].
pub struct Compiler<'a> {
    id_map: HashMap<String, usize>,
    handlers: Option<&'a HandlerRegistry>,
}

impl<'a> Compiler<'a> {
    pub fn new() -> Self {
        Self {
            id_map: HashMap::new(),
            handlers: None,
        }
    }

    /// Service task handlers are checked against `registry` when set.
    pub fn with_handlers(mut self, registry: &'a HandlerRegistry) -> Self {
        self.handlers = Some(registry);
        self
    }

    pub fn compile(&mut self, definition: ProcessDefinition) -> Result<ProcessGraph> {
        // 1. Indexing
        self.id_map.clear();
        for (idx, node) in definition.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                bail!("Node #{} has an empty ID", idx);
            }
            if self.id_map.insert(node.id.clone(), idx).is_some() {
                bail!("Duplicate node ID: {}", node.id);
            }
        }

        // 2. Scopes and flows
        for node in &definition.nodes {
            if let Some(parent) = &node.parent {
                let parent_node = self.lookup(&definition, parent).map_err(|_| {
                    anyhow!("Node {} refers to unknown parent {}", node.id, parent)
                })?;
                if !matches!(parent_node.kind, NodeType::SubProcess) {
                    bail!("Parent {} of node {} is not a sub-process", parent, node.id);
                }
            }
        }
        let mut adjacency: HashMap<&str, Vec<&Flow>> = HashMap::new();
        let mut incoming: HashMap<String, usize> = HashMap::new();
        for flow in &definition.flows {
            self.check_flow(&definition, flow)?;
            adjacency.entry(flow.source.as_str()).or_default().push(flow);
            *incoming.entry(flow.target.clone()).or_default() += 1;
        }

        // 3. Start events, one per scope
        let mut start_event = None;
        let mut scope_starts = HashMap::new();
        for node in definition.nodes.iter().filter(|n| matches!(n.kind, NodeType::StartEvent)) {
            let previous = match &node.parent {
                None => start_event.replace(node.id.clone()),
                Some(scope) => scope_starts.insert(scope.clone(), node.id.clone()),
            };
            if let Some(previous) = previous {
                bail!("Scope of {} has a second start event {}", previous, node.id);
            }
        }
        let start_event = start_event.ok_or_else(|| anyhow!("Start node not found"))?;
        for node in definition.nodes.iter().filter(|n| matches!(n.kind, NodeType::SubProcess)) {
            if !scope_starts.contains_key(&node.id) {
                bail!("Sub-process {} has no start event", node.id);
            }
        }

        // 4. Transform
        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            let outgoing = adjacency.get(node.id.as_str()).map(|v| v.as_slice()).unwrap_or(&[]);
            let flow_node = self.transform_node(&definition, node, outgoing)?;
            nodes.insert(node.id.clone(), flow_node);
        }

        // 5. Attach boundary events in declaration order
        for node in &definition.nodes {
            if let NodeType::BoundaryEvent { attached_to, .. } = &node.kind {
                if let Some(host) = nodes.get_mut(attached_to) {
                    host.boundaries.push(node.id.clone());
                }
            }
        }

        Ok(ProcessGraph {
            key: definition.id,
            name: definition.name,
            nodes,
            start_event,
            scope_starts,
            incoming,
        })
    }

    fn lookup<'d>(&self, definition: &'d ProcessDefinition, id: &str) -> Result<&'d Node> {
        self.id_map
            .get(id)
            .map(|&idx| &definition.nodes[idx])
            .ok_or_else(|| anyhow!("Target node not found: {}", id))
    }

    fn check_flow(&self, definition: &ProcessDefinition, flow: &Flow) -> Result<()> {
        let source = self.lookup(definition, &flow.source)?;
        let target = self.lookup(definition, &flow.target)?;
        if source.parent != target.parent {
            bail!("Flow {} -> {} crosses a sub-process boundary", flow.source, flow.target);
        }
        if matches!(source.kind, NodeType::EndEvent { .. }) {
            bail!("End event {} cannot have outgoing flows", flow.source);
        }
        if matches!(target.kind, NodeType::StartEvent | NodeType::BoundaryEvent { .. }) {
            bail!("Node {} cannot have incoming flows", flow.target);
        }
        Ok(())
    }

    fn transform_node(&self, definition: &ProcessDefinition, node: &Node, outgoing: &[&Flow]) -> Result<FlowNode> {
        let kind = match &node.kind {
            NodeType::StartEvent => NodeKind::StartEvent,
            NodeType::EndEvent {
                terminate,
                terminate_all,
                terminate_multi_instance,
            } => {
                let end_kind = if *terminate || *terminate_all || *terminate_multi_instance {
                    EndEventKind::Terminate {
                        terminate_all: *terminate_all,
                        terminate_multi_instance: *terminate_multi_instance,
                    }
                } else {
                    EndEventKind::None
                };
                NodeKind::EndEvent(end_kind)
            }
            NodeType::UserTask => NodeKind::UserTask,
            NodeType::ServiceTask { handler, params, output } => {
                if let Some(registry) = self.handlers {
                    let action = registry
                        .get(handler)
                        .ok_or_else(|| anyhow!("Unknown handler {} on node {}", handler, node.id))?;
                    action
                        .validate(params)
                        .map_err(|e| anyhow!("Invalid params on node {}: {}", node.id, e))?;
                }
                NodeKind::ServiceTask(ServiceTaskConfig {
                    handler: handler.clone(),
                    params: params.clone(),
                    output: output.clone(),
                })
            }
            NodeType::ExclusiveGateway { default } => {
                if let Some(target) = default {
                    if !outgoing.iter().any(|f| &f.target == target) {
                        bail!("Default flow of gateway {} does not lead to {}", node.id, target);
                    }
                }
                NodeKind::ExclusiveGateway {
                    default_target: default.clone(),
                }
            }
            NodeType::ParallelGateway => NodeKind::ParallelGateway,
            NodeType::SubProcess => NodeKind::SubProcess,
            NodeType::CallActivity { called_element } => {
                if called_element.trim().is_empty() {
                    bail!("Call activity {} has no called element", node.id);
                }
                NodeKind::CallActivity {
                    called_element: called_element.clone(),
                }
            }
            NodeType::BoundaryEvent {
                attached_to,
                timer_ms,
                message,
                cancel_activity,
            } => {
                let host = self
                    .lookup(definition, attached_to)
                    .map_err(|_| anyhow!("Boundary event {} attached to unknown node {}", node.id, attached_to))?;
                if host.parent != node.parent {
                    bail!("Boundary event {} must share the scope of {}", node.id, attached_to);
                }
                if !is_activity(&host.kind) {
                    bail!("Boundary event {} attached to non-activity {}", node.id, attached_to);
                }
                NodeKind::BoundaryEvent {
                    attached_to: attached_to.clone(),
                    trigger: trigger_of(&node.id, *timer_ms, message)?,
                    cancel_activity: *cancel_activity,
                }
            }
            NodeType::IntermediateCatchEvent { timer_ms, message } => NodeKind::IntermediateCatchEvent {
                trigger: trigger_of(&node.id, *timer_ms, message)?,
            },
        };

        let multi_instance = match &node.multi_instance {
            None => None,
            Some(_) if !is_activity(&node.kind) => {
                bail!("Node {} cannot be multi-instance", node.id);
            }
            Some(mi) => Some(multi_instance_config(&node.id, mi)?),
        };

        Ok(FlowNode {
            id: node.id.clone(),
            name: node.name.clone(),
            scope: node.parent.clone(),
            kind,
            outgoing: outgoing
                .iter()
                .map(|f| SequenceFlow {
                    target: f.target.clone(),
                    condition: f.condition.clone(),
                })
                .collect(),
            boundaries: Vec::new(),
            multi_instance,
        })
    }
}

impl Default for Compiler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn is_activity(kind: &NodeType) -> bool {
    matches!(
        kind,
        NodeType::UserTask | NodeType::ServiceTask { .. } | NodeType::SubProcess | NodeType::CallActivity { .. }
    )
}

fn trigger_of(id: &str, timer_ms: Option<u64>, message: &Option<String>) -> Result<EventTrigger> {
    match (timer_ms, message) {
        (Some(duration_ms), None) => Ok(EventTrigger::Timer { duration_ms }),
        (None, Some(name)) => Ok(EventTrigger::Message { name: name.clone() }),
        _ => Err(anyhow!("Event {} needs exactly one of timer_ms or message", id)),
    }
}

fn multi_instance_config(id: &str, mi: &MultiInstance) -> Result<MultiInstanceConfig> {
    if mi.cardinality.is_some() == mi.collection.is_some() {
        bail!("Multi-instance node {} needs exactly one of cardinality or collection", id);
    }
    Ok(MultiInstanceConfig {
        sequential: mi.sequential,
        cardinality: mi.cardinality.clone(),
        collection: mi.collection.clone(),
        element_variable: mi.element_variable.clone(),
        completion_condition: mi.completion_condition.clone(),
    })
}
