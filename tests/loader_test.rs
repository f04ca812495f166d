use flowtree::compiler::loader;
use flowtree::dsl::MultiInstance;
use flowtree::dsl::builder::ProcessBuilder;
use flowtree::runtime::engine::Engine;
use std::collections::HashMap;
use std::fs;

const REVIEW_YAML: &str = r#"
id: "review"
name: "Document review"
nodes:
  - id: "start"
    type: "startEvent"
  - id: "review"
    type: "userTask"
    name: "Review-${loopCounter}"
    multi_instance:
      cardinality: "3"
      completion_condition: "${nrOfCompletedInstances >= 2}"
  - id: "reminder"
    type: "boundaryEvent"
    attached_to: "review"
    timer_ms: 86400000
    cancel_activity: false
  - id: "remind"
    type: "serviceTask"
    handler: "log"
    params:
      msg: "Reminder sent"
  - id: "archive"
    type: "callActivity"
    called_element: "archiving"
  - id: "end"
    type: "endEvent"
  - id: "remindEnd"
    type: "endEvent"
    terminate: true
flows:
  - source: "start"
    target: "review"
  - source: "review"
    target: "archive"
  - source: "archive"
    target: "end"
  - source: "reminder"
    target: "remind"
  - source: "remind"
    target: "remindEnd"
"#;

#[test]
fn test_load_yaml_process() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("review.yaml");
    fs::write(&file_path, REVIEW_YAML).expect("Failed to write temp file");

    let loaded = loader::load_process_from_yaml(&file_path).expect("Failed to load process from YAML");

    let expected = ProcessBuilder::new("review")
        .name("Document review")
        .start("start")
        .user_task("review", "Review-${loopCounter}")
        .multi_instance(
            "review",
            MultiInstance::parallel("3").completion_condition("${nrOfCompletedInstances >= 2}"),
        )
        .timer_boundary("reminder", "review", 86_400_000, false)
        .service_task("remind", "log")
        .param("msg", "Reminder sent")
        .build()
        .call_activity("archive", "archiving")
        .end("end")
        .terminate_end("remindEnd")
        .connect("start", "review")
        .connect("review", "archive")
        .connect("archive", "end")
        .connect("reminder", "remind")
        .connect("remind", "remindEnd")
        .build();

    assert_eq!(loaded, expected);

    temp_dir.close().expect("Failed to close temp dir");
}

#[test]
fn test_boundary_interrupts_by_default() {
    let yaml = r#"
id: "p"
name: "p"
nodes:
  - id: "ping"
    type: "boundaryEvent"
    attached_to: "task"
    message: "ping"
"#;
    let loaded = loader::parse_process_yaml(yaml).unwrap();
    let expected = ProcessBuilder::new("p").message_boundary("ping", "task", "ping", true).build();
    assert_eq!(loaded, expected);
}

#[test]
fn test_load_sub_process_yaml() {
    let yaml = r#"
id: "nested"
name: "nested"
nodes:
  - id: "start"
    type: "startEvent"
  - id: "sub"
    type: "subProcess"
  - id: "subStart"
    type: "startEvent"
    parent: "sub"
  - id: "subEnd"
    type: "endEvent"
    parent: "sub"
    terminate_multi_instance: true
  - id: "end"
    type: "endEvent"
flows:
  - source: "start"
    target: "sub"
  - source: "subStart"
    target: "subEnd"
  - source: "sub"
    target: "end"
"#;
    let loaded = loader::parse_process_yaml(yaml).unwrap();
    let expected = ProcessBuilder::new("nested")
        .start("start")
        .sub_process("sub", |b| b.start("subStart").terminate_multi_instance_end("subEnd"))
        .end("end")
        .connect("start", "sub")
        .connect("subStart", "subEnd")
        .connect("sub", "end")
        .build();
    assert_eq!(loaded, expected);
}

#[test]
fn test_unknown_node_type_is_rejected() {
    let yaml = r#"
id: "p"
name: "p"
nodes:
  - id: "x"
    type: "teleporter"
"#;
    assert!(loader::parse_process_yaml(yaml).is_err());
}

#[test]
fn test_missing_file_reports_path() {
    let err = loader::load_process_from_yaml("/definitely/not/here.yaml").unwrap_err();
    assert!(format!("{:#}", err).contains("/definitely/not/here.yaml"));
}

#[tokio::test]
async fn test_load_directory_and_run() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let archiving = r#"
id: "archiving"
name: "Archiving"
nodes:
  - id: "start"
    type: "startEvent"
  - id: "end"
    type: "endEvent"
flows:
  - source: "start"
    target: "end"
"#;
    fs::write(temp_dir.path().join("b_review.yaml"), REVIEW_YAML).unwrap();
    fs::write(temp_dir.path().join("a_archiving.yml"), archiving).unwrap();
    fs::write(temp_dir.path().join("notes.txt"), "not a process").unwrap();

    let definitions = loader::load_processes_from_dir(temp_dir.path()).unwrap();
    let ids: Vec<&str> = definitions.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["archiving", "review"]);

    let engine = Engine::new();
    for definition in definitions {
        engine.deploy(definition).unwrap();
    }
    let instance_id = engine.start_process("review", HashMap::new()).await.unwrap();
    let tasks = engine.open_tasks(instance_id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(engine.timer_jobs(instance_id).await.unwrap().len(), 1);

    for task in tasks.iter().take(2) {
        engine.complete_task(task.id, HashMap::new()).await.unwrap();
    }
    let snapshot = engine.snapshot(instance_id).await.unwrap();
    assert!(snapshot.executions.iter().all(|e| e.is_ended));
    assert!(engine.timer_jobs(instance_id).await.unwrap().is_empty());
}
