use crate::runtime::execution::{ChangeSet, Execution, InstanceSnapshot, TaskRecord};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

// --- Interfaces ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// A stored revision differed from the expected one; nothing was written.
    VersionConflict { execution_id: Uuid },
}

#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Loads everything stored for a top-level instance.
    async fn load(&self, root_id: Uuid) -> Result<Option<InstanceSnapshot>>;

    /// Applies a change set atomically, provided every expected revision still matches.
    async fn save(&self, changes: ChangeSet) -> Result<SaveOutcome>;

    /// Resolves an execution, instance or task id to its top-level instance.
    async fn locate(&self, key: Uuid) -> Result<Option<Uuid>>;

    /// Ids of every stored top-level instance.
    async fn roots(&self) -> Result<Vec<Uuid>>;
}

/// Durable timer continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerJob {
    pub id: Uuid,
    pub root_process_instance_id: Uuid,
    pub execution_id: Uuid,
    pub activity_id: String,
    pub due_at_ms: i64,
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, job: TimerJob) -> Result<Uuid>;
    async fn cancel(&self, job_id: Uuid) -> Result<()>;
    async fn get(&self, job_id: Uuid) -> Result<Option<TimerJob>>;
    /// Jobs due at or before `now_ms`, earliest first.
    async fn due_jobs(&self, now_ms: i64, limit: usize) -> Result<Vec<TimerJob>>;
}

// --- In-Memory Implementations ---

#[derive(Debug, Default)]
struct StoredTree {
    executions: HashMap<Uuid, Execution>,
    tasks: HashMap<Uuid, TaskRecord>,
}

pub struct InMemoryTreeStore {
    // Map<RootInstanceID, StoredTree>
    trees: DashMap<Uuid, StoredTree>,
    // Map<ExecutionID | TaskID, RootInstanceID>
    index: DashMap<Uuid, Uuid>,
}

impl InMemoryTreeStore {
    pub fn new() -> Self {
        Self {
            trees: DashMap::new(),
            index: DashMap::new(),
        }
    }
}

impl Default for InMemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TreeStore for InMemoryTreeStore {
    async fn load(&self, root_id: Uuid) -> Result<Option<InstanceSnapshot>> {
        let Some(tree) = self.trees.get(&root_id) else {
            return Ok(None);
        };
        let mut executions: Vec<Execution> = tree.executions.values().cloned().collect();
        executions.sort_by_key(|e| e.seq);
        let mut tasks: Vec<TaskRecord> = tree.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(Some(InstanceSnapshot {
            root_id,
            executions,
            tasks,
        }))
    }

    async fn save(&self, changes: ChangeSet) -> Result<SaveOutcome> {
        // The entry guard locks the shard, so check-and-apply is atomic per root.
        let mut tree = self.trees.entry(changes.root_id).or_default();
        for (id, expected) in &changes.expected_revisions {
            let current = tree.executions.get(id).map(|e| e.revision).unwrap_or(0);
            if current != *expected {
                return Ok(SaveOutcome::VersionConflict { execution_id: *id });
            }
        }
        for execution in changes.executions {
            tree.executions.insert(execution.id, execution);
        }
        for task in changes.upserted_tasks {
            tree.tasks.insert(task.id, task);
        }
        for id in &changes.removed_tasks {
            tree.tasks.remove(id);
        }
        drop(tree);
        for key in changes.index_keys {
            self.index.insert(key, changes.root_id);
        }
        Ok(SaveOutcome::Saved)
    }

    async fn locate(&self, key: Uuid) -> Result<Option<Uuid>> {
        Ok(self.index.get(&key).map(|r| *r.value()))
    }

    async fn roots(&self) -> Result<Vec<Uuid>> {
        Ok(self.trees.iter().map(|r| *r.key()).collect())
    }
}

pub struct InMemoryJobScheduler {
    jobs: DashMap<Uuid, TimerJob>,
}

impl InMemoryJobScheduler {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// Every pending job, earliest first.
    pub fn pending(&self) -> Vec<TimerJob> {
        let mut jobs: Vec<TimerJob> = self.jobs.iter().map(|r| r.value().clone()).collect();
        jobs.sort_by_key(|j| (j.due_at_ms, j.id));
        jobs
    }
}

impl Default for InMemoryJobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobScheduler for InMemoryJobScheduler {
    async fn schedule(&self, job: TimerJob) -> Result<Uuid> {
        let id = job.id;
        self.jobs.insert(id, job);
        Ok(id)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.jobs.remove(&job_id);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<TimerJob>> {
        Ok(self.jobs.get(&job_id).map(|r| r.value().clone()))
    }

    async fn due_jobs(&self, now_ms: i64, limit: usize) -> Result<Vec<TimerJob>> {
        let mut due: BTreeMap<(i64, Uuid), TimerJob> = BTreeMap::new();
        for item in self.jobs.iter() {
            if item.due_at_ms <= now_ms {
                due.insert((item.due_at_ms, item.id), item.value().clone());
            }
        }
        Ok(due.into_values().take(limit).collect())
    }
}
