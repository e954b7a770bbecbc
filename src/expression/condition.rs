//! Boolean conditions over the expression evaluator

use crate::error::ExpressionError;
use crate::expression::value::display;
use crate::expression::{ExpressionEvaluator, Scope};
use crate::strategy::Condition;
use serde_json::Value;

/// Evaluates [`Condition`] trees, including `all`/`any` composition
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator {
    evaluator: ExpressionEvaluator,
}

impl ConditionEvaluator {
    pub fn new(evaluator: ExpressionEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    /// Evaluate an optional condition; no condition is vacuously true
    pub fn evaluate_condition<S: Scope + ?Sized>(
        &self,
        condition: Option<&Condition>,
        scope: &S,
    ) -> Result<bool, ExpressionError> {
        match condition {
            None => Ok(true),
            Some(condition) => self.evaluate(condition, scope),
        }
    }

    /// Evaluate a condition given in document form.
    ///
    /// Fails with an [`ExpressionError`] for unknown condition types.
    pub fn evaluate_condition_value<S: Scope + ?Sized>(
        &self,
        condition: Option<&Value>,
        scope: &S,
    ) -> Result<bool, ExpressionError> {
        match condition {
            None | Some(Value::Null) => Ok(true),
            Some(value) => {
                let condition = Condition::from_value(value)
                    .map_err(|message| ExpressionError::new(display(value), message))?;
                self.evaluate(&condition, scope)
            }
        }
    }

    fn evaluate<S: Scope + ?Sized>(
        &self,
        condition: &Condition,
        scope: &S,
    ) -> Result<bool, ExpressionError> {
        match condition {
            Condition::Expression(expression) => self.evaluator.evaluate_bool(expression, scope),
            Condition::Simple(None) => Ok(true),
            Condition::Simple(Some(expression)) => self.evaluator.evaluate_bool(expression, scope),
            Condition::All(nested) => {
                for condition in nested {
                    if !self.evaluate(condition, scope)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any(nested) => {
                for condition in nested {
                    if self.evaluate(condition, scope)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn scope() -> Map<String, Value> {
        json!({"variables": {"count": 3, "enabled": true}})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_vacuous_conditions() {
        let conditions = ConditionEvaluator::default();
        let scope = scope();
        assert!(conditions.evaluate_condition(None, &scope).unwrap());
        assert!(conditions
            .evaluate_condition_value(Some(&json!({"type": "all", "all": []})), &scope)
            .unwrap());
        assert!(!conditions
            .evaluate_condition_value(Some(&json!({"type": "any", "any": []})), &scope)
            .unwrap());
        assert!(conditions
            .evaluate_condition(Some(&Condition::Simple(None)), &scope)
            .unwrap());
    }

    #[test]
    fn test_composite_conditions() {
        let conditions = ConditionEvaluator::default();
        let scope = scope();
        let condition = Condition::All(vec![
            Condition::Expression("${variables.count} > 2".to_string()),
            Condition::Any(vec![
                Condition::Expression("${variables.missing:-false}".to_string()),
                Condition::Simple(Some("${variables.enabled}".to_string())),
            ]),
        ]);
        assert!(conditions.evaluate_condition(Some(&condition), &scope).unwrap());
    }

    #[test]
    fn test_all_short_circuits() {
        let conditions = ConditionEvaluator::default();
        // The second expression would fail to evaluate if reached
        let condition = Condition::All(vec![
            Condition::Expression("False".to_string()),
            Condition::Expression("1 / 0".to_string()),
        ]);
        assert!(!conditions.evaluate_condition(Some(&condition), &scope()).unwrap());
    }

    #[test]
    fn test_unknown_type_is_an_expression_error() {
        let conditions = ConditionEvaluator::default();
        let err = conditions
            .evaluate_condition_value(Some(&json!({"type": "xor", "xor": []})), &scope())
            .unwrap_err();
        assert!(err.message.contains("xor"));
    }
}
