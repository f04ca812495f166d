pub mod builder;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Process definition as authored (YAML or builder).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

/// Node types accepted in a definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeType {
    StartEvent,
    EndEvent {
        #[serde(default)]
        terminate: bool,
        #[serde(default)]
        terminate_all: bool,
        #[serde(default)]
        terminate_multi_instance: bool,
    },
    UserTask,
    ServiceTask {
        handler: String,
        #[serde(default)]
        params: HashMap<String, Value>,
        #[serde(default)]
        output: Option<String>,
    },
    ExclusiveGateway {
        /// Target node of the default flow.
        #[serde(default)]
        default: Option<String>,
    },
    ParallelGateway,
    SubProcess,
    CallActivity {
        called_element: String,
    },
    BoundaryEvent {
        attached_to: String,
        #[serde(default)]
        timer_ms: Option<u64>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default = "default_true")]
        cancel_activity: bool,
    },
    IntermediateCatchEvent {
        #[serde(default)]
        timer_ms: Option<u64>,
        #[serde(default)]
        message: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Id of the enclosing sub-process; absent at process level.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(flatten)]
    pub kind: NodeType,
    #[serde(default)]
    pub multi_instance: Option<MultiInstance>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MultiInstance {
    #[serde(default)]
    pub sequential: bool,
    /// Expression such as `"3"` or `"${reviewers}"`.
    #[serde(default)]
    pub cardinality: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub element_variable: Option<String>,
    #[serde(default)]
    pub completion_condition: Option<String>,
}

impl MultiInstance {
    pub fn parallel(cardinality: &str) -> Self {
        Self {
            cardinality: Some(cardinality.to_string()),
            ..Default::default()
        }
    }

    pub fn sequential(cardinality: &str) -> Self {
        Self {
            sequential: true,
            cardinality: Some(cardinality.to_string()),
            ..Default::default()
        }
    }

    /// One instance per element of the array variable `collection`.
    pub fn over(collection: &str, element_variable: &str) -> Self {
        Self {
            collection: Some(collection.to_string()),
            element_variable: Some(element_variable.to_string()),
            ..Default::default()
        }
    }

    pub fn completion_condition(mut self, condition: &str) -> Self {
        self.completion_condition = Some(condition.to_string());
        self
    }
}

/// Sequence flow between two nodes of the same scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
}
