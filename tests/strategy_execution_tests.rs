//! End-to-end strategy runs through the public API

mod common;

use async_trait::async_trait;
use common::{write_strategy, RecordingActions};
use mapflow::executor::{dependency_levels, CheckpointManager, LegacyAction};
use mapflow::{Strategy, StrategyError, StrategyExecutor};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

fn executor(yaml: &str, actions: &RecordingActions) -> StrategyExecutor {
    let strategy = Strategy::from_yaml_str(yaml).expect("valid strategy");
    StrategyExecutor::new(strategy, actions.registry()).with_env([("HOME", "/home/test")])
}

#[tokio::test]
async fn test_independent_steps_all_execute_in_order() {
    let actions = RecordingActions::new();
    let names: Vec<String> = (0..6).map(|i| format!("step_{i}")).collect();
    let mut yaml = String::from("name: flat\nsteps:\n");
    for name in &names {
        yaml.push_str(&format!("  - {{name: {name}, action: {{type: record}}}}\n"));
    }

    let context = executor(&yaml, &actions).execute(None).await.unwrap();
    assert_eq!(context.execution.executed_steps, names);
    assert!(context.execution.failed_steps.is_empty());
    assert!(context.execution.skipped_steps.is_empty());
    assert_eq!(actions.steps(), names);
}

#[tokio::test(start_paused = true)]
async fn test_retry_invokes_action_exactly_max_attempts() {
    let actions = RecordingActions::new();
    let mut executor = executor(
        r#"
name: retries
steps:
  - name: that_step
    action: {type: fail}
    on_error: {action: retry, max_attempts: 3, backoff: linear, delay: 1}
"#,
        &actions,
    );
    let failure = executor.execute(None).await.unwrap_err();
    assert_eq!(actions.failures(), 3);
    assert!(matches!(failure.source, StrategyError::StepExecution { .. }));
    assert_eq!(failure.context.execution.failed_steps, vec!["that_step"]);
    assert_eq!(
        failure.context.execution.error.as_deref(),
        Some(failure.source.to_string().as_str())
    );
}

#[tokio::test]
async fn test_skip_policy_marks_skipped_and_continues() {
    let actions = RecordingActions::new();
    let context = executor(
        r#"
name: skip
steps:
  - {name: broken, action: {type: fail}, on_error: skip}
  - {name: next, action: {type: record}}
"#,
        &actions,
    )
    .execute(None)
    .await
    .unwrap();
    assert_eq!(context.execution.skipped_steps, vec!["broken"]);
    assert!(!context.execution.executed_steps.contains(&"broken".to_string()));
    assert_eq!(actions.steps(), vec!["next"]);
}

#[test]
fn test_diamond_dependency_levels() {
    let strategy = Strategy::from_yaml_str(
        r#"
name: diamond
execution: {mode: dag}
steps:
  - {name: A, action: {type: noop}}
  - {name: B, action: {type: noop}, depends_on: [A]}
  - {name: C, action: {type: noop}, depends_on: [A]}
  - {name: D, action: {type: noop}, depends_on: [B, C]}
"#,
    )
    .unwrap();
    let levels = dependency_levels(&strategy.steps).unwrap();
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[0], vec!["A"]);
    let mut middle = levels[1].clone();
    middle.sort();
    assert_eq!(middle, vec!["B", "C"]);
    assert_eq!(levels[2], vec!["D"]);
}

#[tokio::test]
async fn test_cycle_fails_before_any_step_runs() {
    let actions = RecordingActions::new();
    let failure = executor(
        r#"
name: cycle
execution: {mode: dag}
steps:
  - {name: A, action: {type: record}, depends_on: [B]}
  - {name: B, action: {type: record}, depends_on: [A]}
"#,
        &actions,
    )
    .execute(None)
    .await
    .unwrap_err();
    assert!(failure.source.to_string().contains("Circular dependency"));
    assert!(actions.calls().is_empty());
}

#[tokio::test]
async fn test_for_each_runs_once_per_item() {
    let actions = RecordingActions::new();
    let context = executor(
        r#"
name: each
steps:
  - name: visit
    for_each: {items: [1, 2, 3], as: value}
    action: {type: record, params: {index: "${foreach.index}", value: "${value}"}}
"#,
        &actions,
    )
    .execute(None)
    .await
    .unwrap();

    let seen: Vec<(Value, Value)> = actions
        .calls()
        .iter()
        .map(|call| (call["index"].clone(), call["value"].clone()))
        .collect();
    assert_eq!(
        seen,
        vec![(json!(0), json!(1)), (json!(1), json!(2)), (json!(2), json!(3))]
    );
    assert!(!context.variables.contains_key("value"));
    assert!(context.binding("foreach").is_none());
    let serialized = serde_json::to_value(&context).unwrap();
    assert!(serialized.get("foreach").is_none());
}

#[tokio::test]
async fn test_repeat_stops_when_condition_turns_false() {
    let actions = RecordingActions::new();
    let context = executor(
        r#"
name: repeat
variables: {counter: 0}
steps:
  - name: increment
    repeat: {max_iterations: 5, while_condition: "${variables.counter} < 3"}
    action: {type: record}
    set_variables: {counter: "${variables.counter} + 1"}
"#,
        &actions,
    )
    .execute(None)
    .await
    .unwrap();
    assert_eq!(actions.calls().len(), 3);
    assert_eq!(context.variables["counter"], json!(3));
}

#[tokio::test]
async fn test_checkpoint_round_trip_through_executor() {
    let dir = TempDir::new().unwrap();
    let actions = RecordingActions::new();
    let yaml = r#"
name: checkpointed
variables: {threshold: 0.75}
parameters: {source: uniprot}
checkpointing: {enabled: true}
steps:
  - {name: load, action: {type: record, params: {rows: 3}}}
  - {name: optional, action: {type: fail}, on_error: skip}
  - {name: broken, action: {type: fail}, on_error: continue}
"#;
    let mut original = executor(yaml, &actions).with_checkpoint_dir(dir.path());
    original.execute(None).await.unwrap();
    let path = original.save_checkpoint("final").await.unwrap().unwrap();

    let mut restored = executor(yaml, &actions).with_checkpoint_dir(dir.path());
    restored.restore_checkpoint(&path).await.unwrap();

    let before = original.context();
    let after = restored.context();
    assert_eq!(after.variables, before.variables);
    assert_eq!(after.parameters, before.parameters);
    assert_eq!(after.steps, before.steps);
    assert_eq!(after.classification(), before.classification());
    assert_eq!(
        CheckpointManager::new(dir.path(), true).list().await.unwrap(),
        vec![path]
    );
}

#[tokio::test]
async fn test_cli_style_file_loading() {
    let dir = TempDir::new().unwrap();
    let path = write_strategy(
        dir.path(),
        "strategy.yaml",
        "name: from_file\nsteps:\n  - {name: only, action: {type: echo, params: {home: \"${env.HOME}\"}}}\n",
    );
    let strategy = Strategy::from_file(&path).await.unwrap();
    let actions = RecordingActions::new();
    let mut executor =
        StrategyExecutor::new(strategy, actions.registry()).with_env([("HOME", "/srv/mapflow")]);
    let context = executor.execute(None).await.unwrap();
    assert_eq!(context.steps["only"].output, json!({"home": "/srv/mapflow"}));
}

struct CountIdentifiers;

#[async_trait]
impl LegacyAction for CountIdentifiers {
    async fn execute(
        &self,
        current_identifiers: &[Value],
        current_ontology_type: Option<&str>,
        _action_params: &Map<String, Value>,
        source_endpoint: Option<&str>,
        target_endpoint: Option<&str>,
        _context: &Map<String, Value>,
    ) -> anyhow::Result<Value> {
        Ok(json!({
            "count": current_identifiers.len(),
            "ontology": current_ontology_type,
            "route": format!("{}->{}", source_endpoint.unwrap_or("?"), target_endpoint.unwrap_or("?")),
            "statistics": {"counted": current_identifiers.len()},
        }))
    }
}

#[tokio::test]
async fn test_legacy_actions_receive_positional_arguments() {
    let actions = RecordingActions::new();
    let mut registry = actions.registry();
    registry.register_legacy("count_ids", CountIdentifiers);
    let strategy = Strategy::from_yaml_str(
        r#"
name: legacy
steps:
  - name: count
    action:
      type: count_ids
      params: {source_endpoint: uniprot, target_endpoint: "${parameters.target}"}
"#,
    )
    .unwrap();
    let mut executor = StrategyExecutor::new(strategy, registry);
    let initial = json!({
        "parameters": {"target": "hmdb"},
        "current_identifiers": ["P1", "P2", "P3"],
        "ontology_type": "UNIPROTKB_AC",
    });
    let context = executor
        .execute(initial.as_object().cloned())
        .await
        .unwrap();

    assert_eq!(
        context.steps["count"].output["route"],
        json!("uniprot->hmdb")
    );
    assert_eq!(context.steps["count"].output["ontology"], json!("UNIPROTKB_AC"));
    assert_eq!(context.statistics["counted"], json!(3));
}
