use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Compiled, immutable process graph. Produced by the compiler, shared by every
/// instance of the same definition key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub key: String,
    pub name: String,
    pub nodes: HashMap<String, FlowNode>,
    /// Process-level start event.
    pub start_event: String,
    /// Start event of each embedded sub-process, keyed by sub-process id.
    pub scope_starts: HashMap<String, String>,
    /// Number of incoming sequence flows per node (used by joins).
    pub incoming: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    /// Raw name, possibly a template such as `Review-${loopCounter}`.
    pub name: Option<String>,
    /// Enclosing embedded sub-process, if any.
    pub scope: Option<String>,
    pub kind: NodeKind,
    pub outgoing: Vec<SequenceFlow>,
    /// Boundary event node ids attached to this node, in declaration order.
    pub boundaries: Vec<String>,
    pub multi_instance: Option<MultiInstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceFlow {
    pub target: String,
    pub condition: Option<String>,
}

/// Closed set of node kinds understood by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeKind {
    StartEvent,
    EndEvent(EndEventKind),
    UserTask,
    ServiceTask(ServiceTaskConfig),
    ExclusiveGateway { default_target: Option<String> },
    ParallelGateway,
    SubProcess,
    CallActivity { called_element: String },
    BoundaryEvent {
        attached_to: String,
        trigger: EventTrigger,
        cancel_activity: bool,
    },
    IntermediateCatchEvent { trigger: EventTrigger },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EndEventKind {
    None,
    Terminate {
        /// End the whole instance chain, including callers of a called instance.
        terminate_all: bool,
        /// End every instance of the enclosing multi-instance activity.
        terminate_multi_instance: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceTaskConfig {
    pub handler: String,
    pub params: HashMap<String, Value>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EventTrigger {
    Timer { duration_ms: u64 },
    Message { name: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MultiInstanceConfig {
    pub sequential: bool,
    /// Expression yielding the number of instances.
    pub cardinality: Option<String>,
    /// Variable holding an array; one instance per element.
    pub collection: Option<String>,
    pub element_variable: Option<String>,
    pub completion_condition: Option<String>,
}

impl NodeKind {
    /// Activity type tag carried by lifecycle events.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::StartEvent => "startEvent",
            NodeKind::EndEvent(_) => "endEvent",
            NodeKind::UserTask => "userTask",
            NodeKind::ServiceTask(_) => "serviceTask",
            NodeKind::ExclusiveGateway { .. } => "exclusiveGateway",
            NodeKind::ParallelGateway => "parallelGateway",
            NodeKind::SubProcess => "subProcess",
            NodeKind::CallActivity { .. } => "callActivity",
            NodeKind::BoundaryEvent { .. } => "boundaryEvent",
            NodeKind::IntermediateCatchEvent { .. } => "intermediateCatchEvent",
        }
    }
}

impl ProcessGraph {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn start_of(&self, scope: Option<&str>) -> Option<&FlowNode> {
        let id = match scope {
            None => Some(&self.start_event),
            Some(scope) => self.scope_starts.get(scope),
        };
        id.and_then(|id| self.nodes.get(id))
    }

    pub fn incoming_count(&self, id: &str) -> usize {
        self.incoming.get(id).copied().unwrap_or(0)
    }
}
