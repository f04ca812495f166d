use anyhow::anyhow;
use flowtree::dsl::builder::ProcessBuilder;
use flowtree::dsl::MultiInstance;
use flowtree::runtime::engine::Engine;
use flowtree::runtime::error::EngineError;
use flowtree::runtime::events::{EventKind, EventListener, LifecycleEvent, RecordingListener};
use flowtree::runtime::execution::{Execution, ExecutionTree, InstanceSnapshot};
use flowtree::runtime::storage::JobScheduler;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

fn engine_with_recorder() -> (Engine, Arc<RecordingListener>) {
    let engine = Engine::new();
    let recorder = Arc::new(RecordingListener::new());
    engine.add_listener(recorder.clone(), EventKind::ALL);
    (engine, recorder)
}

fn summary(events: &[LifecycleEvent]) -> Vec<(EventKind, Option<String>)> {
    events.iter().map(|e| (e.kind, e.activity_id.clone())).collect()
}

fn ev(kind: EventKind, activity_id: &str) -> (EventKind, Option<String>) {
    (kind, Some(activity_id.to_string()))
}

fn process_ev(kind: EventKind) -> (EventKind, Option<String>) {
    (kind, None)
}

fn execution<'a>(snapshot: &'a InstanceSnapshot, id: Uuid) -> &'a Execution {
    snapshot.executions.iter().find(|e| e.id == id).expect("execution in snapshot")
}

/// Validates the stored tree and returns how many executions are waiting.
///
/// Every active leaf must wait on a task, a timer, a message or a live called instance.
async fn assert_tree_consistent(engine: &Engine, instance_id: Uuid) -> usize {
    let tree = ExecutionTree::from_snapshot(engine.snapshot(instance_id).await.unwrap());
    tree.validate_invariants().unwrap();
    let leaves: BTreeSet<Uuid> = tree.active_leaves().into_iter().collect();
    let waiting: BTreeSet<Uuid> = tree
        .executions()
        .filter(|e| !e.is_ended && e.is_active && tree.live_children(e.id).is_empty())
        .filter(|e| {
            tree.task_for_execution(e.id).is_some()
                || e.job_id.is_some()
                || e.message_subscription.is_some()
                || e.sub_process_instance_id.is_some_and(|callee| !tree.is_ended(callee))
        })
        .map(|e| e.id)
        .collect();
    assert_eq!(leaves, waiting);
    leaves.len()
}

/// Closest ancestor of `id` that is the multi-instance root of `activity_id`.
fn mi_root_of(snapshot: &InstanceSnapshot, id: Uuid, activity_id: &str) -> Option<Uuid> {
    let mut current = Some(id);
    while let Some(candidate) = current {
        let e = execution(snapshot, candidate);
        if e.is_multi_instance_root && e.activity_id.as_deref() == Some(activity_id) {
            return Some(candidate);
        }
        current = e.parent_id;
    }
    None
}

fn multi_instance_with_boundary(key: &str, boundary: impl FnOnce(ProcessBuilder) -> ProcessBuilder) -> flowtree::dsl::ProcessDefinition {
    let builder = ProcessBuilder::new(key)
        .start("theStart")
        .user_task("task1", "Task 1")
        .user_task("task2", "Multi User Task-${loopCounter}")
        .multi_instance("task2", MultiInstance::parallel("2"))
        .terminate_end("endEvent1")
        .end("endEvent2");
    boundary(builder)
        .connect("theStart", "task1")
        .connect("theStart", "task2")
        .connect("task1", "endEvent1")
        .connect("task2", "endEvent2")
        .connect("cancelBoundaryEvent1", "endEvent1")
        .build()
}

#[tokio::test]
async fn test_terminate_with_multi_instance_and_boundary() {
    let (engine, recorder) = engine_with_recorder();
    engine
        .deploy(multi_instance_with_boundary("terminate-mi-timer", |b| {
            b.timer_boundary("cancelBoundaryEvent1", "task2", 60_000, true)
        }))
        .unwrap();

    let instance_id = engine.start_process("terminate-mi-timer", HashMap::new()).await.unwrap();
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 4);
    assert_eq!(
        summary(&recorder.events()),
        vec![
            process_ev(EventKind::ProcessStarted),
            ev(EventKind::ActivityStarted, "theStart"),
            ev(EventKind::ActivityCompleted, "theStart"),
            ev(EventKind::ActivityStarted, "task1"),
            ev(EventKind::EntityCreated, "task1"),
            ev(EventKind::ActivityStarted, "task2"),
            ev(EventKind::ActivityStarted, "task2"),
            ev(EventKind::EntityCreated, "task2"),
            ev(EventKind::ActivityStarted, "task2"),
            ev(EventKind::EntityCreated, "task2"),
        ]
    );
    let created: Vec<String> = recorder
        .events()
        .iter()
        .filter(|e| e.kind == EventKind::EntityCreated && e.activity_id.as_deref() == Some("task2"))
        .filter_map(|e| e.task().and_then(|t| t.name.clone()))
        .collect();
    assert_eq!(created, vec!["Multi User Task-0", "Multi User Task-1"]);

    let job = engine.timer_jobs(instance_id).await.unwrap().remove(0);
    let task1 = engine
        .open_tasks(instance_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.activity_id == "task1")
        .unwrap();

    recorder.clear();
    engine.complete_task(task1.id, HashMap::new()).await.unwrap();
    let events = recorder.events();
    assert_eq!(
        summary(&events),
        vec![
            ev(EventKind::EntityCompleted, "task1"),
            ev(EventKind::ActivityCompleted, "task1"),
            ev(EventKind::ActivityStarted, "endEvent1"),
            ev(EventKind::ActivityCancelled, "task2"),
            ev(EventKind::ActivityCancelled, "task2"),
            ev(EventKind::ActivityCancelled, "task2"),
            ev(EventKind::ActivityCancelled, "cancelBoundaryEvent1"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
        ]
    );

    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 0);
    let snapshot = engine.snapshot(instance_id).await.unwrap();
    let cancelled: Vec<&LifecycleEvent> = events
        .iter()
        .filter(|e| e.kind == EventKind::ActivityCancelled && e.activity_id.as_deref() == Some("task2"))
        .collect();
    assert_eq!(execution(&snapshot, cancelled[0].execution_id).loop_counter(), Some(0));
    assert_eq!(execution(&snapshot, cancelled[1].execution_id).loop_counter(), Some(1));
    assert!(execution(&snapshot, cancelled[2].execution_id).loop_counter().is_none());
    for event in &cancelled {
        assert_eq!(event.activity_type.as_deref(), Some("userTask"));
        assert_eq!(event.activity_name.as_deref(), Some("Multi User Task-${loopCounter}"));
    }
    let boundary = events
        .iter()
        .find(|e| e.activity_id.as_deref() == Some("cancelBoundaryEvent1"))
        .unwrap();
    assert_eq!(boundary.activity_type.as_deref(), Some("boundaryEvent"));

    assert!(engine.open_tasks(instance_id).await.unwrap().is_empty());
    assert!(engine.services().scheduler.get(job.id).await.unwrap().is_none());
    assert!(snapshot.executions.iter().all(|e| e.is_ended));
}

#[tokio::test]
async fn test_message_boundary_on_multi_instance_then_terminate() {
    let (engine, recorder) = engine_with_recorder();
    engine
        .deploy(multi_instance_with_boundary("terminate-mi-message", |b| {
            b.message_boundary("cancelBoundaryEvent1", "task2", "cancel", true)
        }))
        .unwrap();

    let instance_id = engine.start_process("terminate-mi-message", HashMap::new()).await.unwrap();
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 4);
    let boundary = engine
        .snapshot(instance_id)
        .await
        .unwrap()
        .executions
        .iter()
        .find(|e| e.message_subscription.is_some())
        .map(|e| e.id)
        .unwrap();

    recorder.clear();
    engine.message_received("cancel", boundary).await.unwrap();
    assert_eq!(
        summary(&recorder.events()),
        vec![
            ev(EventKind::ActivityCancelled, "task2"),
            ev(EventKind::ActivityCancelled, "task2"),
            ev(EventKind::ActivityCancelled, "task2"),
            ev(EventKind::ActivityCompleted, "cancelBoundaryEvent1"),
            ev(EventKind::ActivityStarted, "endEvent1"),
            ev(EventKind::ActivityCancelled, "task1"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
        ]
    );
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 0);
    assert!(engine.open_tasks(instance_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_terminate_sequential_multi_instance_inside_sub_process() {
    let (engine, recorder) = engine_with_recorder();
    let definition = ProcessBuilder::new("terminate-sequential-mi")
        .start("start")
        .sub_process("outerSub", |b| {
            b.start("outerStart")
                .sub_process("miSub", |b| {
                    b.start("miStart")
                        .user_task("A", "A")
                        .parallel_gateway("fork")
                        .user_task("C", "C")
                        .user_task("D", "D")
                        .terminate_multi_instance_end("terminateMi")
                        .end("dEnd")
                        .connect("miStart", "A")
                        .connect("A", "fork")
                        .connect("fork", "C")
                        .connect("fork", "D")
                        .connect("C", "terminateMi")
                        .connect("D", "dEnd")
                })
                .multi_instance("miSub", MultiInstance::sequential("5"))
                .user_task("AfterMi", "After MI")
                .end("outerEnd")
                .connect("outerStart", "miSub")
                .connect("miSub", "AfterMi")
                .connect("AfterMi", "outerEnd")
        })
        .end("end")
        .connect("start", "outerSub")
        .connect("outerSub", "end")
        .build();
    engine.deploy(definition).unwrap();

    let instance_id = engine.start_process("terminate-sequential-mi", HashMap::new()).await.unwrap();
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 1);
    let a = engine.open_tasks(instance_id).await.unwrap().remove(0);
    assert_eq!(a.activity_id, "A");

    engine.complete_task(a.id, HashMap::new()).await.unwrap();
    let tasks = engine.open_tasks(instance_id).await.unwrap();
    let activities: Vec<&str> = tasks.iter().map(|t| t.activity_id.as_str()).collect();
    assert_eq!(activities, vec!["C", "D"]);
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 2);

    recorder.clear();
    engine.complete_task(tasks[0].id, HashMap::new()).await.unwrap();
    assert_eq!(
        summary(&recorder.events()),
        vec![
            ev(EventKind::EntityCompleted, "C"),
            ev(EventKind::ActivityCompleted, "C"),
            ev(EventKind::ActivityStarted, "terminateMi"),
            ev(EventKind::ActivityCancelled, "D"),
            ev(EventKind::ActivityCancelled, "miSub"),
            ev(EventKind::ActivityCompleted, "miSub"),
            ev(EventKind::ActivityStarted, "AfterMi"),
            ev(EventKind::EntityCreated, "AfterMi"),
        ]
    );
    let open = engine.open_tasks(instance_id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].activity_id, "AfterMi");
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 1);
}

#[tokio::test]
async fn test_terminate_nested_multi_instance_with_timer() {
    let (engine, _) = engine_with_recorder();
    let definition = ProcessBuilder::new("nested-mi")
        .start("start")
        .sub_process("outerMi", |b| {
            b.start("outerStart")
                .parallel_gateway("fork")
                .user_task("A", "A")
                .end("aEnd")
                .sub_process("innerMi", |b| {
                    b.start("innerStart")
                        .user_task("B", "B")
                        .timer_catch("timer", 60_000)
                        .terminate_multi_instance_end("innerTerminate")
                        .connect("innerStart", "B")
                        .connect("B", "timer")
                        .connect("timer", "innerTerminate")
                })
                .multi_instance("innerMi", MultiInstance::parallel("6"))
                .user_task("AfterInnerMi", "After inner MI")
                .end("outerEnd")
                .connect("outerStart", "fork")
                .connect("fork", "A")
                .connect("fork", "innerMi")
                .connect("A", "aEnd")
                .connect("innerMi", "AfterInnerMi")
                .connect("AfterInnerMi", "outerEnd")
        })
        .multi_instance("outerMi", MultiInstance::parallel("12"))
        .end("end")
        .connect("start", "outerMi")
        .connect("outerMi", "end")
        .build();
    engine.deploy(definition).unwrap();

    let instance_id = engine.start_process("nested-mi", HashMap::new()).await.unwrap();
    let tasks = engine.open_tasks(instance_id).await.unwrap();
    let b_tasks: Vec<_> = tasks.iter().filter(|t| t.activity_id == "B").collect();
    assert_eq!(b_tasks.len(), 72);
    assert_eq!(tasks.iter().filter(|t| t.activity_id == "A").count(), 12);
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 84);

    // Three B tasks of the same inner multi-instance.
    let snapshot = engine.snapshot(instance_id).await.unwrap();
    let target_root = mi_root_of(&snapshot, b_tasks[0].execution_id, "innerMi").unwrap();
    let same_inner: Vec<Uuid> = b_tasks
        .iter()
        .filter(|t| mi_root_of(&snapshot, t.execution_id, "innerMi") == Some(target_root))
        .map(|t| t.id)
        .collect();
    assert_eq!(same_inner.len(), 6);
    for task_id in same_inner.iter().take(3) {
        engine.complete_task(*task_id, HashMap::new()).await.unwrap();
    }

    let jobs = engine.timer_jobs(instance_id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 84);
    engine.fire_timer(jobs[0].id).await.unwrap();

    let tasks = engine.open_tasks(instance_id).await.unwrap();
    assert_eq!(tasks.iter().filter(|t| t.activity_id == "B").count(), 66);
    assert_eq!(tasks.iter().filter(|t| t.activity_id == "AfterInnerMi").count(), 1);
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 79);
    assert!(engine.timer_jobs(instance_id).await.unwrap().is_empty());
    for job in &jobs {
        assert!(engine.services().scheduler.get(job.id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_global_terminate_without_multi_instance() {
    let (engine, recorder) = engine_with_recorder();
    let definition = ProcessBuilder::new("terminate-now")
        .start("start")
        .terminate_all_end("terminate")
        .connect("start", "terminate")
        .build();
    engine.deploy(definition).unwrap();

    let instance_id = engine.start_process("terminate-now", HashMap::new()).await.unwrap();
    assert_eq!(
        summary(&recorder.events()),
        vec![
            process_ev(EventKind::ProcessStarted),
            ev(EventKind::ActivityStarted, "start"),
            ev(EventKind::ActivityCompleted, "start"),
            ev(EventKind::ActivityStarted, "terminate"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
        ]
    );
    let last = recorder.events().pop().unwrap();
    assert_eq!(last.execution_id, instance_id);
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 0);
}

#[tokio::test]
async fn test_scope_terminate_in_sub_process_continues_after_it() {
    let (engine, recorder) = engine_with_recorder();
    let definition = ProcessBuilder::new("terminate-sub")
        .start("start")
        .parallel_gateway("fork")
        .user_task("outside", "Outside")
        .sub_process("sub", |b| {
            b.start("subStart")
                .parallel_gateway("subFork")
                .user_task("s1", "S1")
                .user_task("s2", "S2")
                .terminate_end("subTerminate")
                .end("s2End")
                .connect("subStart", "subFork")
                .connect("subFork", "s1")
                .connect("subFork", "s2")
                .connect("s1", "subTerminate")
                .connect("s2", "s2End")
        })
        .user_task("afterSub", "After sub")
        .end("end")
        .end("outsideEnd")
        .connect("start", "fork")
        .connect("fork", "sub")
        .connect("fork", "outside")
        .connect("sub", "afterSub")
        .connect("afterSub", "end")
        .connect("outside", "outsideEnd")
        .build();
    engine.deploy(definition).unwrap();

    let instance_id = engine.start_process("terminate-sub", HashMap::new()).await.unwrap();
    let s1 = engine
        .open_tasks(instance_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.activity_id == "s1")
        .unwrap();

    recorder.clear();
    engine.complete_task(s1.id, HashMap::new()).await.unwrap();
    assert_eq!(
        summary(&recorder.events()),
        vec![
            ev(EventKind::EntityCompleted, "s1"),
            ev(EventKind::ActivityCompleted, "s1"),
            ev(EventKind::ActivityStarted, "subTerminate"),
            ev(EventKind::ActivityCancelled, "s2"),
            ev(EventKind::ActivityCompleted, "sub"),
            ev(EventKind::ActivityStarted, "afterSub"),
            ev(EventKind::EntityCreated, "afterSub"),
        ]
    );
    let activities: Vec<String> = engine
        .open_tasks(instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.activity_id)
        .collect();
    assert_eq!(activities, vec!["outside", "afterSub"]);
}

fn deploy_caller(engine: &Engine, callee_end: impl FnOnce(ProcessBuilder) -> ProcessBuilder) {
    let callee = ProcessBuilder::new("callee")
        .start("calleeStart")
        .parallel_gateway("calleeFork")
        .user_task("t1", "T1")
        .user_task("t2", "T2")
        .end("t2End")
        .connect("calleeStart", "calleeFork")
        .connect("calleeFork", "t1")
        .connect("calleeFork", "t2")
        .connect("t1", "calleeTerminate")
        .connect("t2", "t2End");
    engine.deploy(callee_end(callee).build()).unwrap();

    let caller = ProcessBuilder::new("caller")
        .start("start")
        .parallel_gateway("fork")
        .call_activity("call", "callee")
        .user_task("callerTask", "Caller task")
        .user_task("afterCall", "After call")
        .end("end")
        .terminate_end("callerTerminate")
        .connect("start", "fork")
        .connect("fork", "call")
        .connect("fork", "callerTask")
        .connect("call", "afterCall")
        .connect("afterCall", "end")
        .connect("callerTask", "callerTerminate")
        .build();
    engine.deploy(caller).unwrap();
}

async fn task_by_activity(engine: &Engine, instance_id: Uuid, activity_id: &str) -> flowtree::runtime::execution::TaskRecord {
    engine
        .open_tasks(instance_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.activity_id == activity_id)
        .unwrap()
}

#[tokio::test]
async fn test_terminate_in_callee_completes_call_activity() {
    let (engine, recorder) = engine_with_recorder();
    deploy_caller(&engine, |b| b.terminate_end("calleeTerminate"));

    let instance_id = engine.start_process("caller", HashMap::new()).await.unwrap();
    let t1 = task_by_activity(&engine, instance_id, "t1").await;

    recorder.clear();
    engine.complete_task(t1.id, HashMap::new()).await.unwrap();
    assert_eq!(
        summary(&recorder.events()),
        vec![
            ev(EventKind::EntityCompleted, "t1"),
            ev(EventKind::ActivityCompleted, "t1"),
            ev(EventKind::ActivityStarted, "calleeTerminate"),
            ev(EventKind::ActivityCancelled, "t2"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
            ev(EventKind::ActivityCompleted, "call"),
            ev(EventKind::ActivityStarted, "afterCall"),
            ev(EventKind::EntityCreated, "afterCall"),
        ]
    );
    let pcwte = &recorder.events()[4];
    assert_eq!(pcwte.process_instance_id, t1.process_instance_id);

    let activities: Vec<String> = engine
        .open_tasks(instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.activity_id)
        .collect();
    assert_eq!(activities, vec!["callerTask", "afterCall"]);
}

fn deploy_multi_instance_caller(engine: &Engine, multi_instance: MultiInstance) {
    let callee = ProcessBuilder::new("reviewer")
        .start("start")
        .user_task("B", "B")
        .parallel_gateway("fork")
        .user_task("C", "C")
        .user_task("D", "D")
        .terminate_multi_instance_end("terminateMi")
        .end("dEnd")
        .connect("start", "B")
        .connect("B", "fork")
        .connect("fork", "C")
        .connect("fork", "D")
        .connect("C", "terminateMi")
        .connect("D", "dEnd")
        .build();
    engine.deploy(callee).unwrap();

    let caller = ProcessBuilder::new("reviews")
        .start("start")
        .call_activity("callMi", "reviewer")
        .multi_instance("callMi", multi_instance)
        .user_task("AfterMi", "After MI")
        .end("end")
        .connect("start", "callMi")
        .connect("callMi", "AfterMi")
        .connect("AfterMi", "end")
        .build();
    engine.deploy(caller).unwrap();
}

#[tokio::test]
async fn test_terminate_multi_instance_in_callee_ends_parallel_call_activity() {
    let (engine, recorder) = engine_with_recorder();
    deploy_multi_instance_caller(&engine, MultiInstance::parallel("4"));

    let instance_id = engine.start_process("reviews", HashMap::new()).await.unwrap();
    let b_tasks = engine.open_tasks(instance_id).await.unwrap();
    assert_eq!(b_tasks.len(), 4);
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 8);
    for task in b_tasks.iter().take(3) {
        engine.complete_task(task.id, HashMap::new()).await.unwrap();
    }
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 11);

    let c = task_by_activity(&engine, instance_id, "C").await;
    assert_eq!(c.process_instance_id, b_tasks[0].process_instance_id);
    recorder.clear();
    engine.complete_task(c.id, HashMap::new()).await.unwrap();
    let events = recorder.events();
    assert_eq!(
        summary(&events),
        vec![
            ev(EventKind::EntityCompleted, "C"),
            ev(EventKind::ActivityCompleted, "C"),
            ev(EventKind::ActivityStarted, "terminateMi"),
            ev(EventKind::ActivityCancelled, "D"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
            ev(EventKind::ActivityCancelled, "callMi"),
            ev(EventKind::ActivityCancelled, "C"),
            ev(EventKind::ActivityCancelled, "D"),
            process_ev(EventKind::ProcessCancelled),
            ev(EventKind::ActivityCancelled, "callMi"),
            ev(EventKind::ActivityCancelled, "C"),
            ev(EventKind::ActivityCancelled, "D"),
            process_ev(EventKind::ProcessCancelled),
            ev(EventKind::ActivityCancelled, "callMi"),
            ev(EventKind::ActivityCancelled, "B"),
            process_ev(EventKind::ProcessCancelled),
            ev(EventKind::ActivityCancelled, "callMi"),
            ev(EventKind::ActivityCompleted, "callMi"),
            ev(EventKind::ActivityStarted, "AfterMi"),
            ev(EventKind::EntityCreated, "AfterMi"),
        ]
    );
    assert_eq!(events[4].process_instance_id, c.process_instance_id);
    let cancelled_instances: Vec<Uuid> = events
        .iter()
        .filter(|e| e.kind == EventKind::ProcessCancelled)
        .map(|e| e.process_instance_id)
        .collect();
    let others: Vec<Uuid> = b_tasks.iter().skip(1).map(|t| t.process_instance_id).collect();
    assert_eq!(cancelled_instances, others);

    let open: Vec<String> = engine
        .open_tasks(instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.activity_id)
        .collect();
    assert_eq!(open, vec!["AfterMi"]);
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 1);
}

#[tokio::test]
async fn test_terminate_multi_instance_in_callee_ends_sequential_call_activity() {
    let (engine, recorder) = engine_with_recorder();
    deploy_multi_instance_caller(&engine, MultiInstance::sequential("3"));

    let instance_id = engine.start_process("reviews", HashMap::new()).await.unwrap();
    let b = task_by_activity(&engine, instance_id, "B").await;
    assert_eq!(engine.open_tasks(instance_id).await.unwrap().len(), 1);
    engine.complete_task(b.id, HashMap::new()).await.unwrap();
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 3);

    let c = task_by_activity(&engine, instance_id, "C").await;
    recorder.clear();
    engine.complete_task(c.id, HashMap::new()).await.unwrap();
    assert_eq!(
        summary(&recorder.events()),
        vec![
            ev(EventKind::EntityCompleted, "C"),
            ev(EventKind::ActivityCompleted, "C"),
            ev(EventKind::ActivityStarted, "terminateMi"),
            ev(EventKind::ActivityCancelled, "D"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
            ev(EventKind::ActivityCancelled, "callMi"),
            ev(EventKind::ActivityCompleted, "callMi"),
            ev(EventKind::ActivityStarted, "AfterMi"),
            ev(EventKind::EntityCreated, "AfterMi"),
        ]
    );
    let open: Vec<String> = engine
        .open_tasks(instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.activity_id)
        .collect();
    assert_eq!(open, vec!["AfterMi"]);
    assert_eq!(assert_tree_consistent(&engine, instance_id).await, 1);
}

#[tokio::test]
async fn test_global_terminate_in_callee_ends_caller() {
    let (engine, recorder) = engine_with_recorder();
    deploy_caller(&engine, |b| b.terminate_all_end("calleeTerminate"));

    let instance_id = engine.start_process("caller", HashMap::new()).await.unwrap();
    let t1 = task_by_activity(&engine, instance_id, "t1").await;

    recorder.clear();
    engine.complete_task(t1.id, HashMap::new()).await.unwrap();
    let events = recorder.events();
    assert_eq!(
        summary(&events),
        vec![
            ev(EventKind::EntityCompleted, "t1"),
            ev(EventKind::ActivityCompleted, "t1"),
            ev(EventKind::ActivityStarted, "calleeTerminate"),
            ev(EventKind::ActivityCancelled, "t2"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
            ev(EventKind::ActivityCancelled, "call"),
            ev(EventKind::ActivityCancelled, "callerTask"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
        ]
    );
    assert_eq!(events[4].process_instance_id, t1.process_instance_id);
    assert_eq!(events[7].process_instance_id, instance_id);
    assert!(engine.open_tasks(instance_id).await.unwrap().is_empty());

    let snapshot = engine.snapshot(instance_id).await.unwrap();
    assert!(snapshot.executions.iter().all(|e| e.is_ended));
}

#[tokio::test]
async fn test_caller_terminate_cancels_active_callee() {
    let (engine, recorder) = engine_with_recorder();
    deploy_caller(&engine, |b| b.terminate_end("calleeTerminate"));

    let instance_id = engine.start_process("caller", HashMap::new()).await.unwrap();
    let callee_id = task_by_activity(&engine, instance_id, "t1").await.process_instance_id;
    let caller_task = task_by_activity(&engine, instance_id, "callerTask").await;

    recorder.clear();
    engine.complete_task(caller_task.id, HashMap::new()).await.unwrap();
    let events = recorder.events();
    assert_eq!(
        summary(&events),
        vec![
            ev(EventKind::EntityCompleted, "callerTask"),
            ev(EventKind::ActivityCompleted, "callerTask"),
            ev(EventKind::ActivityStarted, "callerTerminate"),
            ev(EventKind::ActivityCancelled, "t1"),
            ev(EventKind::ActivityCancelled, "t2"),
            process_ev(EventKind::ProcessCancelled),
            ev(EventKind::ActivityCancelled, "call"),
            process_ev(EventKind::ProcessCompletedWithTerminateEvent),
        ]
    );
    assert_eq!(events[5].process_instance_id, callee_id);
    assert_eq!(events[7].process_instance_id, instance_id);
    assert!(engine.open_tasks(instance_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_called_instance_directly_is_rejected() {
    let (engine, _) = engine_with_recorder();
    deploy_caller(&engine, |b| b.terminate_end("calleeTerminate"));

    let instance_id = engine.start_process("caller", HashMap::new()).await.unwrap();
    let callee_id = task_by_activity(&engine, instance_id, "t1").await.process_instance_id;

    let err = engine.cancel_process_instance(callee_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));

    engine.cancel_process_instance(instance_id).await.unwrap();
    let snapshot = engine.snapshot(instance_id).await.unwrap();
    assert!(snapshot.executions.iter().all(|e| e.is_ended));
}

struct FailingListener;

impl EventListener for FailingListener {
    fn on_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
        Err(anyhow!("audit store offline"))
    }
}

#[tokio::test]
async fn test_cancellation_continues_past_failures_and_aggregates_them() {
    let (engine, recorder) = engine_with_recorder();
    engine.add_listener(Arc::new(FailingListener), [EventKind::ActivityCancelled]);
    let definition = ProcessBuilder::new("fragile")
        .start("start")
        .user_task("review", "Review-${loopCounter}")
        .multi_instance("review", MultiInstance::parallel("3"))
        .end("end")
        .connect("start", "review")
        .connect("review", "end")
        .build();
    engine.deploy(definition).unwrap();

    let instance_id = engine.start_process("fragile", HashMap::new()).await.unwrap();
    recorder.clear();

    let err = engine.cancel_process_instance(instance_id).await.unwrap_err();
    match &err {
        EngineError::Termination(errors) => {
            assert_eq!(errors.len(), 4);
            assert!(errors.iter().all(|e| matches!(e, EngineError::Listener { .. })));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!err.is_retryable());

    // Every execution was still visited.
    assert_eq!(
        recorder.kinds(),
        vec![
            EventKind::ActivityCancelled,
            EventKind::ActivityCancelled,
            EventKind::ActivityCancelled,
            EventKind::ActivityCancelled,
            EventKind::ProcessCancelled,
        ]
    );
    // Nothing was committed.
    assert_eq!(engine.open_tasks(instance_id).await.unwrap().len(), 3);
}
