use crate::handlers::HandlerRegistry;
use crate::runtime::agenda::{Agenda, Operation};
use crate::runtime::config::EngineConfig;
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::{DispatchScope, EventDispatcher, EventEntity, EventKind, LifecycleEvent, now_ms};
use crate::runtime::execution::{ExecutionTree, TaskRecord};
use crate::runtime::expression::ExpressionResolver;
use crate::runtime::graph::{EventTrigger, FlowNode, ProcessGraph};
use crate::runtime::lifecycle;
use crate::runtime::storage::{JobScheduler, TimerJob, TreeStore};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Collaborators shared by every command of one engine.
pub struct EngineServices {
    pub config: EngineConfig,
    pub definitions: DashMap<String, Arc<ProcessGraph>>,
    pub handlers: HandlerRegistry,
    pub resolver: Arc<dyn ExpressionResolver>,
    pub dispatcher: EventDispatcher,
    pub store: Arc<dyn TreeStore>,
    pub scheduler: Arc<dyn JobScheduler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    /// The target was already ended or consumed; nothing changed.
    AlreadyHandled,
}

/// Side effects to publish once the tree has been committed.
pub struct CommandEffects {
    pub tree: ExecutionTree,
    pub scheduled_jobs: Vec<TimerJob>,
    pub cancelled_jobs: Vec<Uuid>,
    pub operations: usize,
}

/// State of one command: the loaded tree, the agenda and pending job changes.
pub struct CommandContext<'a> {
    pub services: &'a EngineServices,
    pub tree: ExecutionTree,
    agenda: Agenda,
    dispatch: DispatchScope,
    scheduled_jobs: Vec<TimerJob>,
    cancelled_jobs: Vec<Uuid>,
    operations: usize,
}

impl<'a> CommandContext<'a> {
    pub fn new(services: &'a EngineServices, tree: ExecutionTree) -> Self {
        Self {
            services,
            tree,
            agenda: Agenda::new(),
            dispatch: services.dispatcher.scope(),
            scheduled_jobs: Vec::new(),
            cancelled_jobs: Vec::new(),
            operations: 0,
        }
    }

    pub fn plan(&mut self, operation: Operation) {
        self.agenda.plan(operation);
    }

    /// Drains the agenda.
    pub fn run_agenda(&mut self) -> EngineResult<()> {
        while let Some(operation) = self.agenda.next() {
            self.operations += 1;
            if self.operations > self.services.config.max_operations_per_command {
                return Err(EngineError::config(format!(
                    "command exceeded {} operations",
                    self.services.config.max_operations_per_command
                )));
            }
            lifecycle::execute_operation(self, operation)?;
        }
        Ok(())
    }

    pub fn into_effects(self) -> CommandEffects {
        debug!(
            root_id = %self.tree.root_id(),
            operations = self.operations,
            scheduled = self.scheduled_jobs.len(),
            "Command finished"
        );
        CommandEffects {
            tree: self.tree,
            scheduled_jobs: self.scheduled_jobs,
            cancelled_jobs: self.cancelled_jobs,
            operations: self.operations,
        }
    }

    pub fn graph(&self, key: &str) -> EngineResult<Arc<ProcessGraph>> {
        self.services
            .definitions
            .get(key)
            .map(|g| g.value().clone())
            .ok_or_else(|| EngineError::config(format!("process definition '{}' is not deployed", key)))
    }

    pub fn graph_of(&self, execution_id: Uuid) -> EngineResult<Arc<ProcessGraph>> {
        let key = self.tree.require(execution_id)?.process_definition_key.clone();
        self.graph(&key)
    }

    /// Node the execution is positioned at.
    pub fn node_of(&self, execution_id: Uuid) -> EngineResult<FlowNode> {
        let execution = self.tree.require(execution_id)?;
        let activity_id = execution
            .activity_id
            .clone()
            .ok_or_else(|| EngineError::NotFound(format!("activity of execution {}", execution_id)))?;
        let graph = self.graph(&execution.process_definition_key)?;
        graph
            .node(&activity_id)
            .cloned()
            .ok_or_else(|| EngineError::config(format!("unknown node '{}' in '{}'", activity_id, graph.key)))
    }

    pub fn dispatch(&self, event: LifecycleEvent) -> EngineResult<()> {
        self.dispatch.dispatch(&event)
    }

    pub fn emit_activity(&self, kind: EventKind, execution_id: Uuid, node: &FlowNode) -> EngineResult<()> {
        let execution = self.tree.require(execution_id)?;
        self.dispatch(LifecycleEvent {
            kind,
            execution_id,
            process_instance_id: execution.process_instance_id,
            activity_id: Some(node.id.clone()),
            activity_type: Some(node.kind.type_name().to_string()),
            activity_name: node.name.clone(),
            entity: None,
            timestamp_ms: now_ms(),
        })
    }

    pub fn emit_task(&self, kind: EventKind, task: &TaskRecord, node: &FlowNode) -> EngineResult<()> {
        self.dispatch(LifecycleEvent {
            kind,
            execution_id: task.execution_id,
            process_instance_id: task.process_instance_id,
            activity_id: Some(node.id.clone()),
            activity_type: Some(node.kind.type_name().to_string()),
            activity_name: node.name.clone(),
            entity: Some(EventEntity::Task(task.clone())),
            timestamp_ms: now_ms(),
        })
    }

    pub fn emit_process(&self, kind: EventKind, instance_id: Uuid) -> EngineResult<()> {
        let execution = self.tree.require(instance_id)?;
        self.dispatch(LifecycleEvent {
            kind,
            execution_id: instance_id,
            process_instance_id: instance_id,
            activity_id: None,
            activity_type: None,
            activity_name: None,
            entity: Some(EventEntity::ProcessInstance {
                id: instance_id,
                process_definition_key: execution.process_definition_key.clone(),
            }),
            timestamp_ms: now_ms(),
        })
    }

    /// Arms a timer or message wait on `execution_id`.
    pub fn subscribe(&mut self, execution_id: Uuid, activity_id: &str, trigger: &EventTrigger) -> EngineResult<()> {
        match trigger {
            EventTrigger::Timer { duration_ms } => {
                let job = TimerJob {
                    id: Uuid::new_v4(),
                    root_process_instance_id: self.tree.root_id(),
                    execution_id,
                    activity_id: activity_id.to_string(),
                    due_at_ms: now_ms().saturating_add(i64::try_from(*duration_ms).unwrap_or(i64::MAX)),
                };
                self.tree.require_mut(execution_id)?.job_id = Some(job.id);
                self.scheduled_jobs.push(job);
            }
            EventTrigger::Message { name } => {
                self.tree.require_mut(execution_id)?.message_subscription = Some(name.clone());
            }
        }
        Ok(())
    }

    pub fn cancel_job(&mut self, job_id: Uuid) {
        let before = self.scheduled_jobs.len();
        self.scheduled_jobs.retain(|j| j.id != job_id);
        if self.scheduled_jobs.len() == before {
            self.cancelled_jobs.push(job_id);
        }
    }
}
