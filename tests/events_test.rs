use anyhow::bail;
use flowtree::dsl::ProcessDefinition;
use flowtree::dsl::builder::ProcessBuilder;
use flowtree::runtime::engine::Engine;
use flowtree::runtime::error::EngineError;
use flowtree::runtime::events::{EventEntity, EventKind, EventListener, LifecycleEvent, RecordingListener};
use flowtree::runtime::storage::TreeStore;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn approval() -> ProcessDefinition {
    ProcessBuilder::new("approval")
        .start("start")
        .user_task("approve", "Approve ${item}")
        .end("end")
        .connect("start", "approve")
        .connect("approve", "end")
        .build()
}

struct Exploding {
    fail_on_exception: bool,
    calls: AtomicUsize,
}

impl Exploding {
    fn new(fail_on_exception: bool) -> Self {
        Self {
            fail_on_exception,
            calls: AtomicUsize::new(0),
        }
    }
}

impl EventListener for Exploding {
    fn on_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("listener exploded")
    }

    fn fail_on_exception(&self) -> bool {
        self.fail_on_exception
    }
}

#[tokio::test]
async fn test_listener_receives_only_registered_kinds() {
    let engine = Engine::new();
    let recorder = Arc::new(RecordingListener::new());
    engine.add_listener(recorder.clone(), [EventKind::ProcessStarted, EventKind::ProcessCompleted]);
    engine.deploy(approval()).unwrap();

    let instance_id = engine.start_process("approval", HashMap::new()).await.unwrap();
    let task = engine.open_tasks(instance_id).await.unwrap().remove(0);
    engine.complete_task(task.id, HashMap::new()).await.unwrap();

    assert_eq!(recorder.kinds(), vec![EventKind::ProcessStarted, EventKind::ProcessCompleted]);
    for event in recorder.events() {
        assert_eq!(event.process_instance_id, instance_id);
        assert_eq!(
            event.entity,
            Some(EventEntity::ProcessInstance {
                id: instance_id,
                process_definition_key: "approval".to_string(),
            })
        );
    }
}

#[tokio::test]
async fn test_task_events_carry_the_task() {
    let engine = Engine::new();
    let recorder = Arc::new(RecordingListener::new());
    engine.add_listener(recorder.clone(), [EventKind::EntityCreated, EventKind::EntityCompleted]);
    engine.deploy(approval()).unwrap();

    let mut vars = HashMap::new();
    vars.insert("item".to_string(), json!("laptop"));
    let instance_id = engine.start_process("approval", vars).await.unwrap();
    let task = engine.open_tasks(instance_id).await.unwrap().remove(0);
    engine.complete_task(task.id, HashMap::new()).await.unwrap();

    let events = recorder.events();
    assert_eq!(events.len(), 2);
    for event in &events {
        assert_eq!(event.task(), Some(&task));
        assert_eq!(event.activity_type.as_deref(), Some("userTask"));
        // Listeners get the raw template, the task holds the resolved name.
        assert_eq!(event.activity_name.as_deref(), Some("Approve ${item}"));
    }
    assert_eq!(task.name.as_deref(), Some("Approve laptop"));
}

#[tokio::test]
async fn test_removed_listener_stops_receiving() {
    let engine = Engine::new();
    let recorder = Arc::new(RecordingListener::new());
    let id = engine.add_listener(recorder.clone(), EventKind::ALL);
    engine.deploy(approval()).unwrap();

    let instance_id = engine.start_process("approval", HashMap::new()).await.unwrap();
    let seen = recorder.events().len();
    assert!(seen > 0);

    assert!(engine.remove_listener(id));
    assert!(!engine.remove_listener(id));

    let task = engine.open_tasks(instance_id).await.unwrap().remove(0);
    engine.complete_task(task.id, HashMap::new()).await.unwrap();
    assert_eq!(recorder.events().len(), seen);
}

#[tokio::test]
async fn test_tolerated_listener_failure_is_ignored() {
    let engine = Engine::new();
    let exploding = Arc::new(Exploding::new(false));
    engine.add_listener(exploding.clone(), EventKind::ALL);
    let recorder = Arc::new(RecordingListener::new());
    engine.add_listener(recorder.clone(), EventKind::ALL);
    engine.deploy(approval()).unwrap();

    let instance_id = engine.start_process("approval", HashMap::new()).await.unwrap();
    assert_eq!(engine.open_tasks(instance_id).await.unwrap().len(), 1);
    assert_eq!(exploding.calls.load(Ordering::SeqCst), recorder.events().len());
}

#[tokio::test]
async fn test_failing_listener_aborts_the_command() {
    let engine = Engine::new();
    let exploding = Arc::new(Exploding::new(true));
    engine.add_listener(exploding.clone(), [EventKind::EntityCreated]);
    engine.deploy(approval()).unwrap();

    let err = engine.start_process("approval", HashMap::new()).await.unwrap_err();
    match &err {
        EngineError::Listener { kind, .. } => assert_eq!(kind, "ENTITY_CREATED"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(exploding.calls.load(Ordering::SeqCst), 1);
    assert!(engine.services().store.roots().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_listener_order_follows_registration() {
    struct Tagging {
        tag: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl EventListener for Tagging {
        fn on_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.tag);
            Ok(())
        }
    }

    let engine = Engine::new();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        engine.add_listener(
            Arc::new(Tagging {
                tag,
                log: log.clone(),
            }),
            [EventKind::ProcessStarted],
        );
    }
    engine.deploy(approval()).unwrap();
    engine.start_process("approval", HashMap::new()).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn test_event_kind_wire_names() {
    assert_eq!(
        serde_json::to_value(EventKind::ProcessCompletedWithTerminateEvent).unwrap(),
        json!("PROCESS_COMPLETED_WITH_TERMINATE_EVENT")
    );
    assert_eq!(
        serde_json::from_value::<EventKind>(json!("ACTIVITY_CANCELLED")).unwrap(),
        EventKind::ActivityCancelled
    );
    for kind in EventKind::ALL {
        assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        assert_eq!(kind.to_string(), kind.as_str());
    }
}
