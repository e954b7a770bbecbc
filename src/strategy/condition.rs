//! Step and strategy conditions
//!
//! A condition is either a bare expression string or a typed node:
//!
//! ```yaml
//! condition: "${variables.enabled}"
//! condition:
//!   type: all
//!   all:
//!     - "${steps.load.count} > 0"
//!     - type: any
//!       any: ["${env.FAST:-false}", "${variables.force}"]
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

/// A boolean gate on a step or a strategy
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Bare expression string
    Expression(String),
    /// `type: simple` node; a missing expression is vacuously true
    Simple(Option<String>),
    /// `type: all`; true when every nested condition is true
    All(Vec<Condition>),
    /// `type: any`; true when at least one nested condition is true
    Any(Vec<Condition>),
}

impl Condition {
    /// Build a condition from its document form.
    ///
    /// A `type` key is optional when the node's shape makes it obvious.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(expression) => Ok(Condition::Expression(expression.clone())),
            Value::Object(node) => Self::from_node(node),
            other => Err(format!(
                "condition must be an expression string or a mapping, found {other}"
            )),
        }
    }

    fn from_node(node: &Map<String, Value>) -> Result<Self, String> {
        if let Some(key) = node
            .keys()
            .find(|k| !["type", "expression", "all", "any"].contains(&k.as_str()))
        {
            return Err(format!("unknown condition field '{key}'"));
        }

        let kind = match node.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(other) => return Err(format!("condition type must be a string, found {other}")),
            None if node.contains_key("all") => "all",
            None if node.contains_key("any") => "any",
            None => "simple",
        };

        let has = |key: &str| node.contains_key(key);
        match kind {
            "simple" => {
                if has("all") || has("any") {
                    return Err("a simple condition cannot carry 'all' or 'any'".to_string());
                }
                match node.get("expression") {
                    None | Some(Value::Null) => Ok(Condition::Simple(None)),
                    Some(Value::String(expression)) => {
                        Ok(Condition::Simple(Some(expression.clone())))
                    }
                    Some(other) => Err(format!("condition expression must be a string, found {other}")),
                }
            }
            "all" | "any" => {
                let other = if kind == "all" { "any" } else { "all" };
                if has("expression") || has(other) {
                    return Err(format!(
                        "an '{kind}' condition can only carry its '{kind}' list"
                    ));
                }
                let nested = match node.get(kind) {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(Self::from_value)
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(other) => return Err(format!("'{kind}' must be a list, found {other}")),
                    None => return Err(format!("an '{kind}' condition requires an '{kind}' list")),
                };
                Ok(if kind == "all" {
                    Condition::All(nested)
                } else {
                    Condition::Any(nested)
                })
            }
            unknown => Err(format!("unknown condition type '{unknown}'")),
        }
    }

    /// Document form of the condition
    pub fn to_value(&self) -> Value {
        match self {
            Condition::Expression(expression) => Value::String(expression.clone()),
            Condition::Simple(expression) => json!({"type": "simple", "expression": expression}),
            Condition::All(nested) => {
                json!({"type": "all", "all": nested.iter().map(Self::to_value).collect::<Vec<_>>()})
            }
            Condition::Any(nested) => {
                json!({"type": "any", "any": nested.iter().map(Self::to_value).collect::<Vec<_>>()})
            }
        }
    }

    /// Nesting depth; leaves have depth 1
    pub fn depth(&self) -> usize {
        match self {
            Condition::Expression(_) | Condition::Simple(_) => 1,
            Condition::All(nested) | Condition::Any(nested) => {
                1 + nested.iter().map(Self::depth).max().unwrap_or(0)
            }
        }
    }

    /// Every expression string in the tree
    pub fn expressions(&self) -> Vec<&str> {
        let mut found = Vec::new();
        self.collect_expressions(&mut found);
        found
    }

    fn collect_expressions<'a>(&'a self, found: &mut Vec<&'a str>) {
        match self {
            Condition::Expression(expression) | Condition::Simple(Some(expression)) => {
                found.push(expression)
            }
            Condition::Simple(None) => {}
            Condition::All(nested) | Condition::Any(nested) => {
                for condition in nested {
                    condition.collect_expressions(found);
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Condition::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Condition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_shapes() {
        let yaml = r#"
type: all
all:
  - "${a}"
  - type: any
    any: ["${b}", {type: simple, expression: "${c}"}]
"#;
        let condition: Condition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            condition,
            Condition::All(vec![
                Condition::Expression("${a}".to_string()),
                Condition::Any(vec![
                    Condition::Expression("${b}".to_string()),
                    Condition::Simple(Some("${c}".to_string())),
                ]),
            ])
        );
        assert_eq!(condition.depth(), 3);
        assert_eq!(condition.expressions(), vec!["${a}", "${b}", "${c}"]);
    }

    #[test]
    fn test_type_is_inferred_from_shape() {
        let condition: Condition = serde_yaml::from_str("any: []").unwrap();
        assert_eq!(condition, Condition::Any(vec![]));
        let simple: Condition = serde_yaml::from_str("expression: '${x}'").unwrap();
        assert_eq!(simple, Condition::Simple(Some("${x}".to_string())));
    }

    #[test]
    fn test_rejects_mixed_shapes() {
        assert!(serde_yaml::from_str::<Condition>("{type: simple, expression: x, all: []}").is_err());
        assert!(serde_yaml::from_str::<Condition>("{type: all, all: [], any: []}").is_err());
        assert!(serde_yaml::from_str::<Condition>("{type: all}").is_err());
        assert!(serde_yaml::from_str::<Condition>("{type: none_of, items: []}").is_err());
        assert!(serde_yaml::from_str::<Condition>("42").is_err());
    }

    #[test]
    fn test_serialize_round_trips_document_form() {
        let condition = Condition::All(vec![Condition::Expression("${a}".to_string())]);
        let value = serde_json::to_value(&condition).unwrap();
        assert_eq!(value, json!({"type": "all", "all": ["${a}"]}));
        assert_eq!(Condition::from_value(&value).unwrap(), condition);
    }
}
