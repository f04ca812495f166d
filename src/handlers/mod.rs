use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

pub mod builtin;

/// Business logic behind a service task, registered under a name.
pub trait ServiceHandler: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Checks static parameters at deployment time.
    fn validate(&self, _params: &HashMap<String, Value>) -> Result<()> {
        Ok(())
    }

    /// Runs synchronously inside the command. Returning [`FatalError`] marks the
    /// failure as unrecoverable; any other error is a retryable business failure.
    fn execute(&self, params: Value, ctx: &mut HandlerContext) -> Result<Value>;
}

/// Unrecoverable handler failure.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FatalError(pub String);

/// View of the calling execution handed to a handler.
pub struct HandlerContext<'a> {
    pub execution_id: Uuid,
    pub activity_id: &'a str,
    variables: &'a BTreeMap<String, Value>,
    updates: BTreeMap<String, Value>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(execution_id: Uuid, activity_id: &'a str, variables: &'a BTreeMap<String, Value>) -> Self {
        Self {
            execution_id,
            activity_id,
            variables,
            updates: BTreeMap::new(),
        }
    }

    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.updates.get(key).or_else(|| self.variables.get(key))
    }

    pub fn set_var(&mut self, key: &str, value: Value) {
        self.updates.insert(key.to_string(), value);
    }

    /// Variables visible to the execution, including pending writes.
    pub fn vars(&self) -> BTreeMap<String, Value> {
        let mut all = self.variables.clone();
        all.extend(self.updates.iter().map(|(k, v)| (k.clone(), v.clone())));
        all
    }

    pub fn into_updates(self) -> BTreeMap<String, Value> {
        self.updates
    }
}

/// Name -> handler lookup, filled at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn ServiceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in `log` and `assign` handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(builtin::LogHandler));
        registry.register(Arc::new(builtin::AssignHandler));
        registry
    }

    pub fn register(&self, handler: Arc<dyn ServiceHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(name).map(|h| h.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}
