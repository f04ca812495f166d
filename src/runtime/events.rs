use crate::runtime::error::{EngineError, EngineResult};
use crate::runtime::execution::TaskRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ProcessStarted,
    ActivityStarted,
    ActivityCompleted,
    ActivityCancelled,
    EntityCreated,
    EntityCompleted,
    ProcessCompleted,
    ProcessCancelled,
    ProcessCompletedWithTerminateEvent,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ProcessStarted,
        EventKind::ActivityStarted,
        EventKind::ActivityCompleted,
        EventKind::ActivityCancelled,
        EventKind::EntityCreated,
        EventKind::EntityCompleted,
        EventKind::ProcessCompleted,
        EventKind::ProcessCancelled,
        EventKind::ProcessCompletedWithTerminateEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProcessStarted => "PROCESS_STARTED",
            EventKind::ActivityStarted => "ACTIVITY_STARTED",
            EventKind::ActivityCompleted => "ACTIVITY_COMPLETED",
            EventKind::ActivityCancelled => "ACTIVITY_CANCELLED",
            EventKind::EntityCreated => "ENTITY_CREATED",
            EventKind::EntityCompleted => "ENTITY_COMPLETED",
            EventKind::ProcessCompleted => "PROCESS_COMPLETED",
            EventKind::ProcessCancelled => "PROCESS_CANCELLED",
            EventKind::ProcessCompletedWithTerminateEvent => "PROCESS_COMPLETED_WITH_TERMINATE_EVENT",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventEntity {
    Task(TaskRecord),
    ProcessInstance {
        id: Uuid,
        process_definition_key: String,
    },
}

/// Immutable record of one lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    pub activity_id: Option<String>,
    pub activity_type: Option<String>,
    /// Raw node name; templates are not resolved here.
    pub activity_name: Option<String>,
    pub entity: Option<EventEntity>,
    pub timestamp_ms: i64,
}

impl LifecycleEvent {
    pub fn task(&self) -> Option<&TaskRecord> {
        match &self.entity {
            Some(EventEntity::Task(task)) => Some(task),
            _ => None,
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()>;

    /// When `false`, errors from this listener are logged and swallowed.
    fn fail_on_exception(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    kinds: HashSet<EventKind>,
    listener: Arc<dyn EventListener>,
}

/// Registry of listeners, shared by every command of an engine.
#[derive(Default)]
pub struct EventDispatcher {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        listener: Arc<dyn EventListener>,
        kinds: impl IntoIterator<Item = EventKind>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let registration = Registration {
            id,
            kinds: kinds.into_iter().collect(),
            listener,
        };
        self.registrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(registration);
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Listener set frozen for the duration of one command.
    pub fn scope(&self) -> DispatchScope {
        DispatchScope {
            registrations: self
                .registrations
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// Synchronous, publish-ordered fan-out for one unit of work.
pub struct DispatchScope {
    registrations: Vec<Registration>,
}

impl DispatchScope {
    pub fn dispatch(&self, event: &LifecycleEvent) -> EngineResult<()> {
        for registration in &self.registrations {
            if !registration.kinds.contains(&event.kind) {
                continue;
            }
            if let Err(e) = registration.listener.on_event(event) {
                if registration.listener.fail_on_exception() {
                    return Err(EngineError::Listener {
                        kind: event.kind.to_string(),
                        source: e,
                    });
                }
                warn!(kind = %event.kind, execution_id = %event.execution_id, "Listener failed: {:#}", e);
            }
        }
        Ok(())
    }
}

/// Listener that keeps every event it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
