use crate::compiler::core::Compiler;
use crate::dsl::ProcessDefinition;
use crate::handlers::{HandlerRegistry, ServiceHandler};
use crate::runtime::config::EngineConfig;
use crate::runtime::context::{CommandContext, CommandEffects, CommandOutcome, EngineServices};
use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::events::{EventDispatcher, EventKind, EventListener, ListenerId, now_ms};
use crate::runtime::execution::{ExecutionTree, InstanceSnapshot, TaskRecord};
use crate::runtime::expression::{EvalExprResolver, ExpressionResolver};
use crate::runtime::graph::ProcessGraph;
use crate::runtime::lifecycle;
use crate::runtime::storage::{
    InMemoryJobScheduler, InMemoryTreeStore, JobScheduler, SaveOutcome, TimerJob, TreeStore,
};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Entry point of the runtime. Each public command loads one instance tree,
/// runs to quiescence in memory and commits the result in a single save.
pub struct Engine {
    services: EngineServices,
}

impl Engine {
    /// In-memory engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::new_with_storage(
            Arc::new(InMemoryTreeStore::new()),
            Arc::new(InMemoryJobScheduler::new()),
            config,
        )
    }

    pub fn new_with_storage(
        store: Arc<dyn TreeStore>,
        scheduler: Arc<dyn JobScheduler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            services: EngineServices {
                config,
                definitions: DashMap::new(),
                handlers: HandlerRegistry::with_builtins(),
                resolver: Arc::new(EvalExprResolver::new()),
                dispatcher: EventDispatcher::new(),
                store,
                scheduler,
            },
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExpressionResolver>) -> Self {
        self.services.resolver = resolver;
        self
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub fn register_handler(&self, handler: Arc<dyn ServiceHandler>) {
        self.services.handlers.register(handler);
    }

    pub fn add_listener(
        &self,
        listener: Arc<dyn EventListener>,
        kinds: impl IntoIterator<Item = EventKind>,
    ) -> ListenerId {
        self.services.dispatcher.register(listener, kinds)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.services.dispatcher.unregister(id)
    }

    /// Validates and registers a definition. Unknown handlers fail here.
    pub fn deploy(&self, definition: ProcessDefinition) -> EngineResult<String> {
        let graph = Compiler::new()
            .with_handlers(&self.services.handlers)
            .compile(definition)
            .map_err(|e| EngineError::Configuration(format!("{:#}", e)))?;
        Ok(self.deploy_graph(graph))
    }

    pub fn deploy_graph(&self, graph: ProcessGraph) -> String {
        let key = graph.key.clone();
        info!(process_key = %key, nodes = graph.nodes.len(), "Process definition deployed");
        self.services.definitions.insert(key.clone(), Arc::new(graph));
        key
    }

    // --- Commands ---

    pub async fn start_process(&self, process_key: &str, variables: HashMap<String, Value>) -> EngineResult<Uuid> {
        let tree = ExecutionTree::empty(Uuid::new_v4());
        self.execute(tree, |ctx| lifecycle::start_process_instance(ctx, process_key, variables))
            .await
    }

    pub async fn complete_task(&self, task_id: Uuid, variables: HashMap<String, Value>) -> EngineResult<CommandOutcome> {
        let root_id = self.locate(task_id, "task").await?;
        let tree = self.load_tree(root_id).await?;
        self.execute(tree, |ctx| lifecycle::complete_task(ctx, task_id, variables))
            .await
    }

    /// Delivers a timer. Unknown or stale jobs are reported as already handled.
    pub async fn fire_timer(&self, job_id: Uuid) -> EngineResult<CommandOutcome> {
        let scheduler = &self.services.scheduler;
        let Some(job) = scheduler.get(job_id).await.map_err(EngineError::Store)? else {
            return Ok(CommandOutcome::AlreadyHandled);
        };
        let tree = match self.load_tree(job.root_process_instance_id).await {
            Ok(tree) => tree,
            Err(EngineError::NotFound(_)) => {
                scheduler.cancel(job_id).await.map_err(EngineError::Store)?;
                return Ok(CommandOutcome::AlreadyHandled);
            }
            Err(e) => return Err(e),
        };
        let outcome = self.execute(tree, |ctx| lifecycle::fire_timer(ctx, &job)).await?;
        if outcome == CommandOutcome::AlreadyHandled {
            scheduler.cancel(job_id).await.map_err(EngineError::Store)?;
        }
        Ok(outcome)
    }

    pub async fn message_received(&self, message: &str, execution_id: Uuid) -> EngineResult<CommandOutcome> {
        let root_id = self.locate(execution_id, "execution").await?;
        let tree = self.load_tree(root_id).await?;
        self.execute(tree, |ctx| lifecycle::deliver_message(ctx, message, execution_id))
            .await
    }

    /// Cancels a top-level instance together with everything it called.
    pub async fn cancel_process_instance(&self, instance_id: Uuid) -> EngineResult<CommandOutcome> {
        let root_id = self.locate(instance_id, "process instance").await?;
        if root_id != instance_id {
            return Err(EngineError::config(format!(
                "{} is a called instance; cancel its top-level instance {} instead",
                instance_id, root_id
            )));
        }
        let tree = self.load_tree(root_id).await?;
        self.execute(tree, |ctx| lifecycle::cancel_process_instance(ctx, instance_id))
            .await
    }

    /// Fires every timer due at `now_ms`. Returns how many were applied.
    pub async fn run_due_jobs(&self, now_ms: i64) -> EngineResult<usize> {
        let jobs = self
            .services
            .scheduler
            .due_jobs(now_ms, self.services.config.job_batch_size)
            .await
            .map_err(EngineError::Store)?;
        let mut fired = 0;
        for job in jobs {
            match self.fire_timer(job.id).await {
                Ok(CommandOutcome::Applied) => fired += 1,
                Ok(CommandOutcome::AlreadyHandled) => {
                    debug!(job_id = %job.id, "Timer already handled");
                }
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %job.id, "Timer will be retried: {}", e);
                }
                Err(e) => {
                    error!(job_id = %job.id, activity_id = %job.activity_id, "Timer failed: {}", e);
                }
            }
        }
        Ok(fired)
    }

    /// Polls for due timers until `shutdown` resolves.
    pub async fn run_worker<S: Future<Output = ()>>(&self, shutdown: S) {
        let period = Duration::from_millis(self.services.config.job_poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        tokio::pin!(shutdown);
        info!("Worker started.");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    match self.run_due_jobs(now_ms()).await {
                        Ok(0) => {}
                        Ok(fired) => debug!(fired, "Timers fired"),
                        Err(e) => error!("Failed to poll due jobs: {}", e),
                    }
                }
            }
        }
        info!("Worker stopped.");
    }

    // --- Queries ---

    /// Stored state of the tree that contains `instance_id`.
    pub async fn snapshot(&self, instance_id: Uuid) -> EngineResult<InstanceSnapshot> {
        let root_id = self.locate(instance_id, "process instance").await?;
        Ok(self.load_tree(root_id).await?.snapshot())
    }

    /// Open tasks of the tree containing `instance_id`, in creation order.
    pub async fn open_tasks(&self, instance_id: Uuid) -> EngineResult<Vec<TaskRecord>> {
        Ok(self.snapshot(instance_id).await?.tasks)
    }

    /// Pending timers of the tree containing `instance_id`, in execution creation order.
    pub async fn timer_jobs(&self, instance_id: Uuid) -> EngineResult<Vec<TimerJob>> {
        let snapshot = self.snapshot(instance_id).await?;
        let mut jobs = Vec::new();
        for execution in snapshot.executions.iter().filter(|e| !e.is_ended) {
            let Some(job_id) = execution.job_id else { continue };
            if let Some(job) = self.services.scheduler.get(job_id).await.map_err(EngineError::Store)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    // --- Internals ---

    async fn locate(&self, key: Uuid, what: &str) -> EngineResult<Uuid> {
        self.services
            .store
            .locate(key)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::NotFound(format!("{} {}", what, key)))
    }

    async fn load_tree(&self, root_id: Uuid) -> EngineResult<ExecutionTree> {
        let snapshot = self
            .services
            .store
            .load(root_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::NotFound(format!("process instance {}", root_id)))?;
        Ok(ExecutionTree::from_snapshot(snapshot))
    }

    async fn execute<T, F>(&self, tree: ExecutionTree, body: F) -> EngineResult<T>
    where
        F: FnOnce(&mut CommandContext<'_>) -> EngineResult<T>,
    {
        let (result, effects) = {
            let mut ctx = CommandContext::new(&self.services, tree);
            let result = body(&mut ctx)?;
            ctx.run_agenda()?;
            (result, ctx.into_effects())
        };
        self.commit(effects).await?;
        Ok(result)
    }

    async fn commit(&self, effects: CommandEffects) -> EngineResult<()> {
        let change_set = effects.tree.change_set();
        if !change_set.is_empty() {
            let outcome = self
                .services
                .store
                .save(change_set)
                .await
                .map_err(EngineError::Store)?;
            if let SaveOutcome::VersionConflict { execution_id } = outcome {
                warn!(execution_id = %execution_id, "Optimistic lock conflict, command discarded");
                return Err(EngineError::Contention { execution_id });
            }
        }
        for job in effects.scheduled_jobs {
            self.services.scheduler.schedule(job).await.map_err(EngineError::Store)?;
        }
        for job_id in effects.cancelled_jobs {
            self.services.scheduler.cancel(job_id).await.map_err(EngineError::Store)?;
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
