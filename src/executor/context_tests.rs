use super::*;
use crate::expression::ExpressionEvaluator;
use serde_json::json;

fn context() -> ExecutionContext {
    let mut context = ExecutionContext::default().with_env([("OPENAI_API_KEY", "sk-test")]);
    context.variables.insert("threshold".into(), json!(0.8));
    context.parameters.insert("source".into(), json!("uniprot"));
    context
}

#[test]
fn test_scope_resolves_typed_sections() {
    let mut context = context();
    context.record_step_result(
        "baseline",
        StepResult::new(json!({"metrics": {"score": 0.9}}), 1, 5),
    );
    context.set_current_identifiers(vec![json!("P12345")]);

    let evaluator = ExpressionEvaluator::new();
    assert_eq!(
        evaluator
            .evaluate("${steps.baseline.metrics.score} > ${variables.threshold}", &context)
            .unwrap(),
        json!(true)
    );
    assert_eq!(
        evaluator.evaluate("${current_identifiers[0]}", &context).unwrap(),
        json!("P12345")
    );
    assert_eq!(
        evaluator.evaluate("${has_api_key('openai')}", &context).unwrap(),
        json!(true)
    );
    assert_eq!(evaluator.evaluate("parameters['source']", &context).unwrap(), json!("uniprot"));
}

#[test]
fn test_bindings_shadow_and_restore_variables() {
    let mut context = context();
    context.variables.insert("item".into(), json!("original"));

    let shadowed = context.bind("item", json!(7), true);
    context.bind("foreach", json!({"index": 0, "item": 7, "total": 1}), false);
    let evaluator = ExpressionEvaluator::new();
    assert_eq!(evaluator.evaluate("${item} + ${foreach.index}", &context).unwrap(), json!(7));
    assert_eq!(context.variables["item"], json!(7));

    context.unbind("item", true, shadowed);
    context.unbind("foreach", false, None);
    assert_eq!(context.variables["item"], json!("original"));
    assert!(context.binding("foreach").is_none());
}

#[test]
fn test_fork_and_merge_replays_in_order() {
    let mut parent = context();
    let mut first = parent.fork();
    let mut second = parent.fork();

    first.set_variable("last", json!(1));
    first.mark_executed("a");
    second.set_variable("last", json!(2));
    second.mark_failed("b");

    // Forks do not see each other's writes
    assert!(!first.variables.contains_key("shared"));
    parent.merge(first);
    parent.merge(second);

    assert_eq!(parent.variables["last"], json!(2));
    assert_eq!(parent.execution.executed_steps, vec!["a"]);
    assert_eq!(parent.execution.failed_steps, vec!["b"]);
}

#[test]
fn test_bindings_are_not_merged() {
    let mut parent = context();
    let mut fork = parent.fork();
    fork.bind("row", json!(1), true);
    fork.set_variable("seen", json!(true));
    parent.merge(fork);
    assert!(!parent.variables.contains_key("row"));
    assert_eq!(parent.variables["seen"], json!(true));
}

#[test]
fn test_merge_initial_splits_known_and_extra_keys() {
    let mut context = ExecutionContext::default();
    let initial = json!({
        "variables": {"x": 1},
        "current_identifiers": ["A", "B"],
        "initial_identifier": "A",
        "ontology_type": "UNIPROT",
        "steps": "not a map"
    });
    context.merge_initial(initial.as_object().cloned().unwrap());
    assert_eq!(context.variables["x"], json!(1));
    assert_eq!(context.current_identifiers.len(), 2);
    assert_eq!(context.extra["ontology_type"], json!("UNIPROT"));
    assert!(context.steps.is_empty());
}

#[test]
fn test_classification_lists_are_unique() {
    let mut context = context();
    context.mark_executed("a");
    context.mark_executed("a");
    let (executed, failed, skipped) = context.classification();
    assert_eq!(executed, ["a".to_string()]);
    assert!(failed.is_empty() && skipped.is_empty());
}

#[test]
fn test_latest_classification_wins() {
    let mut context = context();
    context.mark_executed("a");
    context.mark_skipped("b");
    context.mark_failed("a");
    context.mark_executed("b");
    let (executed, failed, skipped) = context.classification();
    assert_eq!(executed, ["b".to_string()]);
    assert_eq!(failed, ["a".to_string()]);
    assert!(skipped.is_empty());

    let mut fork = context.fork();
    fork.mark_skipped("a");
    context.merge(fork);
    let (_, failed, skipped) = context.classification();
    assert!(failed.is_empty());
    assert_eq!(skipped, ["a".to_string()]);
}

#[test]
fn test_serialized_form_round_trips() {
    let mut context = context();
    context.extra.insert("ontology_type".into(), json!("HMDB"));
    context.mark_skipped("s");
    let text = serde_json::to_string(&context).unwrap();
    let restored: ExecutionContext = serde_json::from_str(&text).unwrap();
    assert_eq!(restored.variables, context.variables);
    assert_eq!(restored.execution, context.execution);
    assert_eq!(restored.extra["ontology_type"], json!("HMDB"));
}
