use crate::runtime::execution::{ChangeSet, Execution, InstanceSnapshot, TaskRecord};
use crate::runtime::storage::{JobScheduler, SaveOutcome, TimerJob, TreeStore};
use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use uuid::Uuid;

// Check-and-set over the revision hash of one tree.
// KEYS: executions, revisions, tasks, index, roots
// ARGV: root, n, (id, expected, payload) * n, m, (id, payload) * m, r, id * r, k, key * k
const SAVE_SCRIPT: &str = r#"
    local executions, revisions, tasks, index, roots = KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5]
    local root = ARGV[1]
    local n = tonumber(ARGV[2])

    local pos = 3
    for i = 1, n do
        local current = tonumber(redis.call("HGET", revisions, ARGV[pos]) or "0")
        if current ~= tonumber(ARGV[pos + 1]) then
            return ARGV[pos]
        end
        pos = pos + 3
    end

    pos = 3
    for i = 1, n do
        redis.call("HSET", executions, ARGV[pos], ARGV[pos + 2])
        redis.call("HSET", revisions, ARGV[pos], tonumber(ARGV[pos + 1]) + 1)
        pos = pos + 3
    end

    local m = tonumber(ARGV[pos]); pos = pos + 1
    for i = 1, m do
        redis.call("HSET", tasks, ARGV[pos], ARGV[pos + 1])
        pos = pos + 2
    end

    local r = tonumber(ARGV[pos]); pos = pos + 1
    for i = 1, r do
        redis.call("HDEL", tasks, ARGV[pos])
        pos = pos + 1
    end

    local k = tonumber(ARGV[pos]); pos = pos + 1
    for i = 1, k do
        redis.call("HSET", index, ARGV[pos], root)
        pos = pos + 1
    end

    redis.call("SADD", roots, root)
    return ""
"#;

pub struct RedisTreeStore {
    client: redis::Client,
    prefix: String,
    save_script: redis::Script,
}

impl RedisTreeStore {
    pub fn new(client: redis::Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            save_script: redis::Script::new(SAVE_SCRIPT),
        }
    }

    fn tree_key(&self, root_id: Uuid, part: &str) -> String {
        format!("{}:tree:{}:{}", self.prefix, root_id, part)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.prefix)
    }

    fn roots_key(&self) -> String {
        format!("{}:roots", self.prefix)
    }
}

#[async_trait]
impl TreeStore for RedisTreeStore {
    async fn load(&self, root_id: Uuid) -> Result<Option<InstanceSnapshot>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw_executions: HashMap<String, String> = conn.hgetall(self.tree_key(root_id, "executions")).await?;
        if raw_executions.is_empty() {
            return Ok(None);
        }
        let raw_tasks: HashMap<String, String> = conn.hgetall(self.tree_key(root_id, "tasks")).await?;

        let mut executions = Vec::with_capacity(raw_executions.len());
        for payload in raw_executions.values() {
            executions.push(serde_json::from_str::<Execution>(payload)?);
        }
        executions.sort_by_key(|e| e.seq);
        let mut tasks = Vec::with_capacity(raw_tasks.len());
        for payload in raw_tasks.values() {
            tasks.push(serde_json::from_str::<TaskRecord>(payload)?);
        }
        tasks.sort_by_key(|t| t.seq);

        Ok(Some(InstanceSnapshot {
            root_id,
            executions,
            tasks,
        }))
    }

    async fn save(&self, changes: ChangeSet) -> Result<SaveOutcome> {
        let root_id = changes.root_id;
        let mut invocation = self.save_script.prepare_invoke();
        invocation
            .key(self.tree_key(root_id, "executions"))
            .key(self.tree_key(root_id, "revisions"))
            .key(self.tree_key(root_id, "tasks"))
            .key(self.index_key())
            .key(self.roots_key())
            .arg(root_id.to_string())
            .arg(changes.executions.len());
        for execution in &changes.executions {
            let expected = changes.expected_revisions.get(&execution.id).copied().unwrap_or(0);
            invocation
                .arg(execution.id.to_string())
                .arg(expected)
                .arg(serde_json::to_string(execution)?);
        }
        invocation.arg(changes.upserted_tasks.len());
        for task in &changes.upserted_tasks {
            invocation.arg(task.id.to_string()).arg(serde_json::to_string(task)?);
        }
        invocation.arg(changes.removed_tasks.len());
        for id in &changes.removed_tasks {
            invocation.arg(id.to_string());
        }
        invocation.arg(changes.index_keys.len());
        for key in &changes.index_keys {
            invocation.arg(key.to_string());
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let conflict: String = invocation.invoke_async(&mut conn).await?;
        if conflict.is_empty() {
            Ok(SaveOutcome::Saved)
        } else {
            Ok(SaveOutcome::VersionConflict {
                execution_id: Uuid::parse_str(&conflict)?,
            })
        }
    }

    async fn locate(&self, key: Uuid) -> Result<Option<Uuid>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let root: Option<String> = conn.hget(self.index_key(), key.to_string()).await?;
        Ok(root.map(|r| Uuid::parse_str(&r)).transpose()?)
    }

    async fn roots(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let roots: Vec<String> = conn.smembers(self.roots_key()).await?;
        Ok(roots.iter().filter_map(|r| Uuid::parse_str(r).ok()).collect())
    }
}

/// Timer jobs kept in a sorted set scored by due time, payloads in a hash.
pub struct RedisJobScheduler {
    client: redis::Client,
    prefix: String,
}

impl RedisJobScheduler {
    pub fn new(client: redis::Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
        }
    }

    fn due_key(&self) -> String {
        format!("{}:jobs:due", self.prefix)
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }
}

#[async_trait]
impl JobScheduler for RedisJobScheduler {
    async fn schedule(&self, job: TimerJob) -> Result<Uuid> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let id = job.id.to_string();
        let payload = serde_json::to_string(&job)?;
        let _: () = conn.hset(self.jobs_key(), &id, payload).await?;
        let _: () = conn.zadd(self.due_key(), &id, job.due_at_ms).await?;
        Ok(job.id)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let id = job_id.to_string();
        let _: () = conn.zrem(self.due_key(), &id).await?;
        let _: () = conn.hdel(self.jobs_key(), &id).await?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<TimerJob>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = conn.hget(self.jobs_key(), job_id.to_string()).await?;
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    async fn due_jobs(&self, now_ms: i64, limit: usize) -> Result<Vec<TimerJob>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.due_key(), "-inf", now_ms, 0, limit as isize)
            .await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let payload: Option<String> = conn.hget(self.jobs_key(), &id).await?;
            if let Some(payload) = payload {
                jobs.push(serde_json::from_str(&payload)?);
            }
        }
        Ok(jobs)
    }
}
