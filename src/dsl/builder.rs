use crate::dsl::{Flow, MultiInstance, Node, NodeType, ProcessDefinition};
use serde_json::Value;
use std::collections::HashMap;

/// Fluent construction of a [`ProcessDefinition`].
///
/// ```
/// use flowtree::dsl::builder::ProcessBuilder;
///
/// let definition = ProcessBuilder::new("review")
///     .start("start")
///     .user_task("review", "Review")
///     .end("end")
///     .connect("start", "review")
///     .connect("review", "end")
///     .build();
/// assert_eq!(definition.nodes.len(), 3);
/// ```
pub struct ProcessBuilder {
    id: String,
    name: String,
    scope: Option<String>,
    pub nodes: Vec<Node>,
    flows: Vec<Flow>,
}

impl ProcessBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            scope: None,
            nodes: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    fn push(mut self, id: &str, name: Option<&str>, kind: NodeType) -> Self {
        self.nodes.push(Node {
            id: id.to_string(),
            name: name.map(str::to_string),
            parent: self.scope.clone(),
            kind,
            multi_instance: None,
        });
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.push(id, None, NodeType::StartEvent)
    }

    pub fn end(self, id: &str) -> Self {
        self.push(
            id,
            None,
            NodeType::EndEvent {
                terminate: false,
                terminate_all: false,
                terminate_multi_instance: false,
            },
        )
    }

    /// Terminate end event ending the enclosing scope.
    pub fn terminate_end(self, id: &str) -> Self {
        self.push(
            id,
            None,
            NodeType::EndEvent {
                terminate: true,
                terminate_all: false,
                terminate_multi_instance: false,
            },
        )
    }

    /// Terminate end event ending the whole instance chain.
    pub fn terminate_all_end(self, id: &str) -> Self {
        self.push(
            id,
            None,
            NodeType::EndEvent {
                terminate: true,
                terminate_all: true,
                terminate_multi_instance: false,
            },
        )
    }

    /// Terminate end event ending every instance of the enclosing multi-instance activity.
    pub fn terminate_multi_instance_end(self, id: &str) -> Self {
        self.push(
            id,
            None,
            NodeType::EndEvent {
                terminate: true,
                terminate_all: false,
                terminate_multi_instance: true,
            },
        )
    }

    pub fn user_task(self, id: &str, name: &str) -> Self {
        self.push(id, Some(name), NodeType::UserTask)
    }

    pub fn service_task(self, id: &str, handler: &str) -> ServiceTaskBuilder {
        ServiceTaskBuilder {
            process_builder: self,
            id: id.to_string(),
            handler: handler.to_string(),
            params: HashMap::new(),
            output: None,
        }
    }

    pub fn exclusive_gateway(self, id: &str, default: Option<&str>) -> Self {
        self.push(
            id,
            None,
            NodeType::ExclusiveGateway {
                default: default.map(str::to_string),
            },
        )
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.push(id, None, NodeType::ParallelGateway)
    }

    /// Embedded sub-process; nodes and flows added inside `body` belong to it.
    pub fn sub_process(self, id: &str, body: impl FnOnce(ProcessBuilder) -> ProcessBuilder) -> Self {
        let outer_scope = self.scope.clone();
        let mut builder = self.push(id, None, NodeType::SubProcess);
        builder.scope = Some(id.to_string());
        let mut builder = body(builder);
        builder.scope = outer_scope;
        builder
    }

    pub fn call_activity(self, id: &str, called_element: &str) -> Self {
        self.push(
            id,
            None,
            NodeType::CallActivity {
                called_element: called_element.to_string(),
            },
        )
    }

    pub fn timer_boundary(self, id: &str, attached_to: &str, timer_ms: u64, cancel_activity: bool) -> Self {
        self.push(
            id,
            None,
            NodeType::BoundaryEvent {
                attached_to: attached_to.to_string(),
                timer_ms: Some(timer_ms),
                message: None,
                cancel_activity,
            },
        )
    }

    pub fn message_boundary(self, id: &str, attached_to: &str, message: &str, cancel_activity: bool) -> Self {
        self.push(
            id,
            None,
            NodeType::BoundaryEvent {
                attached_to: attached_to.to_string(),
                timer_ms: None,
                message: Some(message.to_string()),
                cancel_activity,
            },
        )
    }

    pub fn timer_catch(self, id: &str, timer_ms: u64) -> Self {
        self.push(
            id,
            None,
            NodeType::IntermediateCatchEvent {
                timer_ms: Some(timer_ms),
                message: None,
            },
        )
    }

    pub fn message_catch(self, id: &str, message: &str) -> Self {
        self.push(
            id,
            None,
            NodeType::IntermediateCatchEvent {
                timer_ms: None,
                message: Some(message.to_string()),
            },
        )
    }

    /// Sets the display name (may contain `${...}` placeholders) of an existing node.
    pub fn named(mut self, id: &str, name: &str) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.name = Some(name.to_string());
        }
        self
    }

    /// Marks an existing node as multi-instance.
    pub fn multi_instance(mut self, id: &str, config: MultiInstance) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.multi_instance = Some(config);
        }
        self
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.flows.push(Flow {
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
        });
        self
    }

    pub fn connect_if(mut self, source: &str, target: &str, condition: &str) -> Self {
        self.flows.push(Flow {
            source: source.to_string(),
            target: target.to_string(),
            condition: Some(condition.to_string()),
        });
        self
    }

    pub fn build(self) -> ProcessDefinition {
        ProcessDefinition {
            id: self.id,
            name: self.name,
            nodes: self.nodes,
            flows: self.flows,
        }
    }
}

pub struct ServiceTaskBuilder {
    process_builder: ProcessBuilder,
    id: String,
    handler: String,
    params: HashMap<String, Value>,
    output: Option<String>,
}

impl ServiceTaskBuilder {
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn output(mut self, var_name: &str) -> Self {
        self.output = Some(var_name.to_string());
        self
    }

    pub fn build(self) -> ProcessBuilder {
        let id = self.id;
        self.process_builder.push(
            &id,
            None,
            NodeType::ServiceTask {
                handler: self.handler,
                params: self.params,
                output: self.output,
            },
        )
    }
}
