use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy of a single engine command.
///
/// Every variant aborts the command: the in-memory snapshot is dropped and
/// nothing is written to the tree store.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid definition or runtime configuration. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another command committed first. Safe to retry from a fresh load.
    #[error("concurrent modification of execution {execution_id}")]
    Contention { execution_id: Uuid },

    /// Business failure raised by an activity behavior or a service handler.
    #[error("activity '{activity_id}' failed: {source}")]
    Behavior {
        activity_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Failure a handler flagged as unrecoverable.
    #[error("fatal failure in activity '{activity_id}': {message}")]
    Fatal { activity_id: String, message: String },

    #[error("listener failed on {kind}: {source}")]
    Listener {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    /// Aggregate of every failure collected during one termination pass.
    #[error("termination finished with {} error(s)", .0.len())]
    Termination(Vec<EngineError>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("store failure: {0}")]
    Store(#[source] anyhow::Error),
}

impl EngineError {
    /// Whether the same command may succeed if it is submitted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Contention { .. }
            | EngineError::Behavior { .. }
            | EngineError::Expression { .. }
            | EngineError::Store(_) => true,
            EngineError::Termination(errors) => errors.iter().all(EngineError::is_retryable),
            _ => false,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
