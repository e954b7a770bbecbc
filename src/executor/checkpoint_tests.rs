use super::*;
use serde_json::json;
use tempfile::TempDir;

fn populated_context() -> ExecutionContext {
    let mut context = ExecutionContext::default();
    context.set_variable("threshold", json!(0.8));
    context.parameters.insert("source".into(), json!("uniprot"));
    context.record_step_result("load", StepResult::new(json!({"rows": 3}), 1, 12));
    context.record_metrics("load", json!({"rows": 3}));
    context.mark_executed("load");
    context.mark_failed("map");
    context.mark_skipped("report");
    context
}

#[tokio::test]
async fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path(), true);
    let context = populated_context();

    let path = manager
        .save("protein mapping", "after_load", &context)
        .await
        .unwrap()
        .unwrap();
    let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
    assert!(file_name.starts_with("protein_mapping_after_load_"));
    assert!(file_name.ends_with(".json"));

    let checkpoint = CheckpointManager::load(&path).await.unwrap();
    assert_eq!(checkpoint.strategy_name, "protein mapping");
    assert_eq!(checkpoint.checkpoint_name, "after_load");

    let restored = checkpoint.into_context();
    assert_eq!(restored.variables, context.variables);
    assert_eq!(restored.parameters, context.parameters);
    assert_eq!(restored.steps, context.steps);
    assert_eq!(restored.metrics, context.metrics);
    assert_eq!(restored.classification(), context.classification());
}

#[tokio::test]
async fn test_document_has_expected_keys() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path(), true);
    let path = manager
        .save("s", "before_a", &populated_context())
        .await
        .unwrap()
        .unwrap();

    let raw: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    for key in [
        "strategy_name",
        "checkpoint_name",
        "timestamp",
        "context",
        "variables",
        "parameters",
        "executed_steps",
        "failed_steps",
        "skipped_steps",
        "step_results",
        "step_metrics",
    ] {
        assert!(raw.get(key).is_some(), "missing key {key}");
    }
}

#[tokio::test]
async fn test_disabled_manager_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path().join("never"), false);
    let saved = manager.save("s", "before_a", &populated_context()).await.unwrap();
    assert!(saved.is_none());
    assert!(!dir.path().join("never").exists());
    assert!(manager.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_returns_only_json_files() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path(), true);
    manager.save("s", "before_a", &populated_context()).await.unwrap();
    manager.save("s", "after_a", &populated_context()).await.unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let listed = manager.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].to_string_lossy().contains("after_a"));
}

#[tokio::test]
async fn test_load_reports_checkpoint_errors() {
    let dir = TempDir::new().unwrap();
    let missing = CheckpointManager::load(dir.path().join("absent.json")).await;
    assert!(matches!(missing, Err(StrategyError::Checkpoint { .. })));

    let corrupt = dir.path().join("corrupt.json");
    std::fs::write(&corrupt, "{not json").unwrap();
    let err = CheckpointManager::load(&corrupt).await.unwrap_err();
    assert!(err.to_string().contains("Failed to parse checkpoint"));
}
