use serde_json::json;
use std::fs;
use tokenflow::compiler::loader;
use tokenflow::dsl::builder::ProcessBuilder;
use tokenflow::{Engine, Variables};

const ORDER_YAML: &str = r#"
key: "order"
name: "Order Handling"
variables:
  region: "eu"
nodes:
  - id: "start"
    type: "StartEvent"
  - id: "record"
    type: "ServiceTask"
    delegate_expression: "assign"
    fields:
      - name: "expression"
        value: "total = amount * 2"
  - id: "approve"
    type: "UserTask"
    name: "Approve order"
    assignee: "${manager}"
  - id: "cancelled"
    type: "BoundaryEvent"
    attached_to: "approve"
    trigger:
      kind: "Signal"
      name: "cancel-order"
  - id: "end"
    type: "EndEvent"
  - id: "aborted"
    type: "EndEvent"
flows:
  - id: "start->record"
    source: "start"
    target: "record"
  - id: "record->approve"
    source: "record"
    target: "approve"
  - id: "approve->end"
    source: "approve"
    target: "end"
  - id: "cancelled->aborted"
    source: "cancelled"
    target: "aborted"
"#;

fn expected_order() -> tokenflow::dsl::ProcessDefinition {
    ProcessBuilder::new("order")
        .name("Order Handling")
        .var("region", "eu")
        .start("start")
        .service_task("record", "assign")
        .field("expression", "total = amount * 2")
        .build()
        .user_task("approve")
        .name("Approve order")
        .assignee("${manager}")
        .build()
        .signal_boundary("cancelled", "approve", "cancel-order", true)
        .end("end")
        .end("aborted")
        .connect("start", "record")
        .connect("record", "approve")
        .connect("approve", "end")
        .connect("cancelled", "aborted")
        .build()
}

#[test]
fn test_load_yaml_definition_matches_builder() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("order.yaml");
    fs::write(&file_path, ORDER_YAML).expect("Failed to write temp file");

    let loaded = loader::load_definition_from_yaml(&file_path).expect("Failed to load definition from YAML");
    assert_eq!(loaded, expected_order());
}

#[test]
fn test_load_directory_skips_other_files() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    fs::write(temp_dir.path().join("b_order.yaml"), ORDER_YAML).unwrap();
    fs::write(
        temp_dir.path().join("a_ping.yml"),
        "key: ping\nname: Ping\nnodes:\n  - id: start\n    type: StartEvent\n  - id: end\n    type: EndEvent\nflows:\n  - id: f\n    source: start\n    target: end\n",
    )
    .unwrap();
    fs::write(temp_dir.path().join("notes.txt"), "not a definition").unwrap();

    let loaded = loader::load_definitions_from_dir(temp_dir.path()).unwrap();
    let keys: Vec<&str> = loaded.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, vec!["ping", "order"]);
}

#[test]
fn test_malformed_yaml_reports_the_file() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("broken.yaml");
    fs::write(&file_path, "key: broken\nnodes: [ { id: x, type: Teleporter } ]\n").unwrap();

    let err = loader::load_definition_from_yaml(&file_path).unwrap_err();
    assert!(format!("{err:#}").contains("broken.yaml"));
}

#[tokio::test]
async fn test_loaded_definition_runs() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("order.yaml");
    fs::write(&file_path, ORDER_YAML).unwrap();

    let engine = Engine::new();
    engine.deploy(loader::load_definition_from_yaml(&file_path).unwrap()).unwrap();

    let mut start = Variables::new();
    start.insert("amount".to_string(), json!(21));
    start.insert("manager".to_string(), json!("kim"));
    let pid = engine.start_process("order", start).await.unwrap();

    let task = engine.tasks(pid).await.unwrap().remove(0);
    assert_eq!(task.assignee.as_deref(), Some("kim"));
    let variables = engine.task_variables(task.id).await.unwrap();
    assert_eq!(variables.get("total"), Some(&json!(42)));
    assert_eq!(variables.get("region"), Some(&json!("eu")));

    let delivery = engine.send_signal("cancel-order", None, Some(pid)).await.unwrap();
    assert_eq!(delivery.delivered, 1);
    assert!(engine.executions(pid).await.unwrap().is_empty());
}
