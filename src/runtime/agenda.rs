use std::collections::VecDeque;
use uuid::Uuid;

/// Unit of work planned by behaviors and drained by the command loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Enter the node the execution is positioned at.
    Continue(Uuid),
    /// Leave the current node through its outgoing sequence flows.
    TakeOutgoing { execution_id: Uuid, emit_completed: bool },
}

/// FIFO queue of planned operations.
#[derive(Debug, Default)]
pub struct Agenda {
    operations: VecDeque<Operation>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&mut self, operation: Operation) {
        self.operations.push_back(operation);
    }

    pub fn next(&mut self) -> Option<Operation> {
        self.operations.pop_front()
    }
}
