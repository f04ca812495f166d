use crate::runtime::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

pub const LOOP_COUNTER: &str = "loopCounter";

/// One token (or scope) in the execution tree of a process instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: Uuid,
    /// Creation ordinal inside the snapshot. Defines sibling order.
    pub seq: u64,
    pub process_definition_key: String,
    /// Equals `id` for an instance root.
    pub process_instance_id: Uuid,
    /// Top-level instance of the call chain; the unit of storage.
    pub root_process_instance_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub children: Vec<Uuid>,
    /// `None` for instance roots.
    pub activity_id: Option<String>,
    pub is_active: bool,
    pub is_scope: bool,
    pub is_ended: bool,
    pub is_concurrent: bool,
    pub is_multi_instance_root: bool,
    pub variables: BTreeMap<String, Value>,
    /// Set on boundary-event executions: the execution they are attached to.
    pub boundary_of: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub message_subscription: Option<String>,
    /// On a called instance root: the caller's call-activity execution.
    pub super_execution_id: Option<Uuid>,
    /// On a call-activity execution: the called instance root.
    pub sub_process_instance_id: Option<Uuid>,
    pub revision: u64,
}

impl Execution {
    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn loop_counter(&self) -> Option<i64> {
        self.variables.get(LOOP_COUNTER).and_then(Value::as_i64)
    }
}

/// An open user task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    pub root_process_instance_id: Uuid,
    pub activity_id: String,
    /// Name with `${...}` placeholders already resolved.
    pub name: Option<String>,
    pub seq: u64,
}

/// Everything stored for one top-level instance, including called instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub root_id: Uuid,
    pub executions: Vec<Execution>,
    pub tasks: Vec<TaskRecord>,
}

/// Writes produced by one command, guarded by the revisions seen at load time.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub root_id: Uuid,
    /// Revision each touched execution had when loaded; `0` means "must not exist yet".
    pub expected_revisions: BTreeMap<Uuid, u64>,
    /// Touched executions carrying their next revision.
    pub executions: Vec<Execution>,
    pub upserted_tasks: Vec<TaskRecord>,
    pub removed_tasks: Vec<Uuid>,
    /// New lookup keys (execution, instance and task ids) that resolve to `root_id`.
    pub index_keys: Vec<Uuid>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty() && self.upserted_tasks.is_empty() && self.removed_tasks.is_empty()
    }
}

/// In-memory arena of executions for one top-level instance.
///
/// Every mutation goes through this type so the set of touched records, and
/// the revisions they were loaded with, is known when the command commits.
#[derive(Debug, Default)]
pub struct ExecutionTree {
    root_id: Uuid,
    executions: HashMap<Uuid, Execution>,
    tasks: BTreeMap<Uuid, TaskRecord>,
    next_seq: u64,
    loaded_revisions: HashMap<Uuid, u64>,
    dirty: BTreeSet<Uuid>,
    touched_tasks: BTreeSet<Uuid>,
    removed_tasks: BTreeSet<Uuid>,
    index_keys: Vec<Uuid>,
}

impl ExecutionTree {
    /// Empty tree for a top-level instance that does not exist yet.
    pub fn empty(root_id: Uuid) -> Self {
        Self {
            root_id,
            ..Default::default()
        }
    }

    pub fn from_snapshot(snapshot: InstanceSnapshot) -> Self {
        let mut tree = Self::empty(snapshot.root_id);
        for execution in snapshot.executions {
            tree.next_seq = tree.next_seq.max(execution.seq + 1);
            tree.loaded_revisions.insert(execution.id, execution.revision);
            tree.executions.insert(execution.id, execution);
        }
        for task in snapshot.tasks {
            tree.next_seq = tree.next_seq.max(task.seq + 1);
            tree.tasks.insert(task.id, task);
        }
        tree
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let mut executions: Vec<Execution> = self.executions.values().cloned().collect();
        executions.sort_by_key(|e| e.seq);
        InstanceSnapshot {
            root_id: self.root_id,
            executions,
            tasks: self.tasks(),
        }
    }

    pub fn root_id(&self) -> Uuid {
        self.root_id
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Creates an instance root. Without a caller the root takes the tree's own id.
    pub fn create_process_instance(
        &mut self,
        process_definition_key: &str,
        super_execution_id: Option<Uuid>,
    ) -> EngineResult<Uuid> {
        let id = match super_execution_id {
            None => self.root_id,
            Some(_) => Uuid::new_v4(),
        };
        if self.executions.contains_key(&id) {
            return Err(EngineError::config(format!("process instance {} already exists", id)));
        }
        if let Some(caller) = super_execution_id {
            self.require_mut(caller)?.sub_process_instance_id = Some(id);
        }
        let seq = self.next_seq();
        let execution = Execution {
            id,
            seq,
            process_definition_key: process_definition_key.to_string(),
            process_instance_id: id,
            root_process_instance_id: self.root_id,
            parent_id: None,
            children: Vec::new(),
            activity_id: None,
            is_active: true,
            is_scope: true,
            is_ended: false,
            is_concurrent: false,
            is_multi_instance_root: false,
            variables: BTreeMap::new(),
            boundary_of: None,
            job_id: None,
            message_subscription: None,
            super_execution_id,
            sub_process_instance_id: None,
            revision: 0,
        };
        self.insert_new(execution);
        Ok(id)
    }

    /// Appends a new child at the end of `parent_id`'s children.
    pub fn create_child(&mut self, parent_id: Uuid) -> EngineResult<Uuid> {
        let parent = self.require(parent_id)?;
        if parent.is_ended {
            return Err(EngineError::config(format!(
                "cannot create a child of ended execution {}",
                parent_id
            )));
        }
        let id = Uuid::new_v4();
        let process_definition_key = parent.process_definition_key.clone();
        let process_instance_id = parent.process_instance_id;
        let seq = self.next_seq();
        let execution = Execution {
            id,
            seq,
            process_definition_key,
            process_instance_id,
            root_process_instance_id: self.root_id,
            parent_id: Some(parent_id),
            children: Vec::new(),
            activity_id: None,
            is_active: true,
            is_scope: false,
            is_ended: false,
            is_concurrent: false,
            is_multi_instance_root: false,
            variables: BTreeMap::new(),
            boundary_of: None,
            job_id: None,
            message_subscription: None,
            super_execution_id: None,
            sub_process_instance_id: None,
            revision: 0,
        };
        self.require_mut(parent_id)?.children.push(id);
        self.insert_new(execution);
        Ok(id)
    }

    fn insert_new(&mut self, execution: Execution) {
        let id = execution.id;
        self.executions.insert(id, execution);
        self.dirty.insert(id);
        self.index_keys.push(id);
    }

    pub fn get(&self, id: Uuid) -> Option<&Execution> {
        self.executions.get(&id)
    }

    /// Mutable access; the execution is written back on commit.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Execution> {
        let execution = self.executions.get_mut(&id)?;
        self.dirty.insert(id);
        Some(execution)
    }

    pub fn require(&self, id: Uuid) -> EngineResult<&Execution> {
        self.get(id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", id)))
    }

    pub fn require_mut(&mut self, id: Uuid) -> EngineResult<&mut Execution> {
        self.get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", id)))
    }

    pub fn is_ended(&self, id: Uuid) -> bool {
        self.get(id).is_none_or(|e| e.is_ended)
    }

    /// Logically deletes an execution. Ending is final.
    pub fn end(&mut self, id: Uuid) -> EngineResult<()> {
        let execution = self.require_mut(id)?;
        execution.is_ended = true;
        execution.is_active = false;
        execution.job_id = None;
        execution.message_subscription = None;
        Ok(())
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    /// Non-ended children in creation order.
    pub fn live_children(&self, id: Uuid) -> Vec<Uuid> {
        self.get(id)
            .map(|e| {
                e.children
                    .iter()
                    .copied()
                    .filter(|c| !self.is_ended(*c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Non-ended executions of the subtree rooted at `id`, children before their
    /// parent and siblings in creation order. Called instances are not included.
    pub fn post_order(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        self.collect_post_order(id, &mut out);
        out
    }

    fn collect_post_order(&self, id: Uuid, out: &mut Vec<Uuid>) {
        if self.is_ended(id) {
            return;
        }
        for child in self.live_children(id) {
            self.collect_post_order(child, out);
        }
        out.push(id);
    }

    /// First scope above `id` (never `id` itself).
    pub fn nearest_scope(&self, id: Uuid) -> Option<Uuid> {
        let mut current = self.get(id)?.parent_id;
        while let Some(candidate) = current {
            let execution = self.get(candidate)?;
            if execution.is_scope {
                return Some(candidate);
            }
            current = execution.parent_id;
        }
        None
    }

    /// The multi-instance root owning `id`, when `id` is one of its instances.
    pub fn multi_instance_root_of(&self, id: Uuid) -> Option<Uuid> {
        let execution = self.get(id)?;
        let parent = self.get(execution.parent_id?)?;
        (parent.is_multi_instance_root && parent.activity_id == execution.activity_id)
            .then_some(parent.id)
    }

    /// Chain from `id` up to (and including) its instance root.
    fn instance_chain(&self, id: Uuid) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(candidate) = current {
            let Some(execution) = self.get(candidate) else { break };
            chain.push(candidate);
            current = execution.parent_id;
        }
        chain
    }

    /// Variables visible from `id`: locals shadow those of ancestors.
    pub fn visible_variables(&self, id: Uuid) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        for ancestor in self.instance_chain(id).into_iter().rev() {
            if let Some(execution) = self.get(ancestor) {
                merged.extend(execution.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        merged
    }

    pub fn get_variable(&self, id: Uuid, name: &str) -> Option<&Value> {
        self.instance_chain(id)
            .into_iter()
            .find_map(|a| self.get(a).and_then(|e| e.variables.get(name)))
    }

    /// Writes to the nearest execution already holding `name`, otherwise to the instance root.
    pub fn set_variable(&mut self, id: Uuid, name: &str, value: Value) -> EngineResult<()> {
        let chain = self.instance_chain(id);
        let target = chain
            .iter()
            .copied()
            .find(|a| self.get(*a).is_some_and(|e| e.variables.contains_key(name)))
            .or_else(|| chain.last().copied())
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", id)))?;
        self.set_local_variable(target, name, value)
    }

    pub fn set_local_variable(&mut self, id: Uuid, name: &str, value: Value) -> EngineResult<()> {
        self.require_mut(id)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    /// Non-ended, active executions without non-ended children.
    pub fn active_leaves(&self) -> Vec<Uuid> {
        let mut leaves: Vec<&Execution> = self
            .executions
            .values()
            .filter(|e| !e.is_ended && e.is_active && self.live_children(e.id).is_empty())
            .collect();
        leaves.sort_by_key(|e| e.seq);
        leaves.into_iter().map(|e| e.id).collect()
    }

    pub fn add_task(
        &mut self,
        execution_id: Uuid,
        activity_id: &str,
        name: Option<String>,
    ) -> EngineResult<TaskRecord> {
        let execution = self.require(execution_id)?;
        let process_instance_id = execution.process_instance_id;
        let task = TaskRecord {
            id: Uuid::new_v4(),
            execution_id,
            process_instance_id,
            root_process_instance_id: self.root_id,
            activity_id: activity_id.to_string(),
            name,
            seq: self.next_seq(),
        };
        self.touched_tasks.insert(task.id);
        self.index_keys.push(task.id);
        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    pub fn remove_task(&mut self, task_id: Uuid) -> Option<TaskRecord> {
        let task = self.tasks.remove(&task_id)?;
        self.touched_tasks.remove(&task_id);
        self.removed_tasks.insert(task_id);
        Some(task)
    }

    pub fn task(&self, task_id: Uuid) -> Option<&TaskRecord> {
        self.tasks.get(&task_id)
    }

    pub fn task_for_execution(&self, execution_id: Uuid) -> Option<&TaskRecord> {
        self.tasks.values().find(|t| t.execution_id == execution_id)
    }

    /// Open tasks in creation order.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Collects the writes of this command.
    pub fn change_set(&self) -> ChangeSet {
        let mut change_set = ChangeSet {
            root_id: self.root_id,
            index_keys: self.index_keys.clone(),
            ..Default::default()
        };
        for id in &self.dirty {
            let Some(execution) = self.executions.get(id) else { continue };
            let expected = self.loaded_revisions.get(id).copied().unwrap_or(0);
            change_set.expected_revisions.insert(*id, expected);
            let mut written = execution.clone();
            written.revision = expected + 1;
            change_set.executions.push(written);
        }
        change_set.upserted_tasks = self
            .touched_tasks
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect();
        change_set.removed_tasks = self.removed_tasks.iter().copied().collect();
        change_set
    }

    /// Checks the structural invariants of the tree.
    pub fn validate_invariants(&self) -> EngineResult<()> {
        let top_level_roots = self
            .executions
            .values()
            .filter(|e| e.parent_id.is_none() && e.super_execution_id.is_none())
            .count();
        if !self.executions.is_empty() && top_level_roots != 1 {
            return Err(EngineError::config(format!(
                "expected one top-level root, found {}",
                top_level_roots
            )));
        }
        for execution in self.executions.values() {
            if let Some(parent_id) = execution.parent_id {
                let parent = self.require(parent_id)?;
                if !parent.children.contains(&execution.id) {
                    return Err(EngineError::config(format!(
                        "execution {} is not listed under its parent {}",
                        execution.id, parent_id
                    )));
                }
                if parent.is_ended && !execution.is_ended {
                    return Err(EngineError::config(format!(
                        "live execution {} under ended parent {}",
                        execution.id, parent_id
                    )));
                }
                if parent.process_instance_id != execution.process_instance_id {
                    return Err(EngineError::config(format!(
                        "execution {} crosses an instance boundary",
                        execution.id
                    )));
                }
            } else if execution.process_instance_id != execution.id {
                return Err(EngineError::config(format!(
                    "instance root {} has a foreign instance id",
                    execution.id
                )));
            }
            if execution.is_ended && execution.is_active {
                return Err(EngineError::config(format!(
                    "ended execution {} is still active",
                    execution.id
                )));
            }
        }
        Ok(())
    }
}
