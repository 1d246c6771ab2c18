//! Structural record matching: AND over keys, OR over list values, recursive
//! over nested mappings.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A leaf value on the right-hand side of a scalar or OR rule.
#[derive(Clone)]
pub enum Leaf {
    /// Plain equality / membership target.
    Literal(Value),
    /// A late-binding target: invoked with no arguments on every match.
    Callable(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl Leaf {
    fn resolve(&self) -> Value {
        match self {
            Leaf::Literal(value) => value.clone(),
            Leaf::Callable(callable) => callable(),
        }
    }
}

impl fmt::Debug for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leaf::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Leaf::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

impl From<Value> for Leaf {
    fn from(value: Value) -> Self {
        Leaf::Literal(value)
    }
}

impl PartialEq for Leaf {
    /// Closures have no useful notion of equality, so a `Callable` leaf never
    /// compares equal to anything, including another `Callable` (handler/
    /// condition-based unregistration is conservative rather than wrong).
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Leaf::Literal(a), Leaf::Literal(b)) => a == b,
            _ => false,
        }
    }
}

/// The rule attached to a single key of a [`Condition`].
#[derive(Debug, Clone, PartialEq)]
enum RuleNode {
    /// Equality (or membership, if the record's value at this key is a list).
    Scalar(Leaf),
    /// OR: matches if any leaf matches under the scalar rule.
    AnyOf(Vec<Leaf>),
    /// Recurse: the record's value at this key must itself be a matching record.
    Nested(Condition),
}

/// An immutable, recursive structural predicate over JSON-object-shaped records.
///
/// Built with [`Condition::builder`]. A condition with no keys matches every
/// record (the base case of the AND-over-keys rule).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    rules: HashMap<String, RuleNode>,
}

/// Incrementally assembles a [`Condition`].
#[derive(Debug, Default)]
pub struct ConditionBuilder {
    rules: HashMap<String, RuleNode>,
}

impl Condition {
    pub fn builder() -> ConditionBuilder {
        ConditionBuilder::default()
    }

    /// A condition that matches every record.
    pub fn any() -> Self {
        Condition::default()
    }

    /// Build a condition from a JSON object using only the literal subset of
    /// the grammar: object values recurse, array values become OR-of-literal,
    /// everything else is an equality leaf. Callable leaves are not
    /// expressible from JSON and must be added via [`Condition::builder`].
    pub fn from_literal(value: Value) -> Self {
        let mut builder = Condition::builder();
        if let Value::Object(map) = value {
            for (key, rule_value) in map {
                match rule_value {
                    Value::Object(_) => {
                        builder = builder.nested(key, Condition::from_literal(rule_value));
                    }
                    Value::Array(items) => {
                        builder = builder.any_of(key, items.into_iter().map(Leaf::from));
                    }
                    scalar => {
                        builder = builder.eq(key, scalar);
                    }
                }
            }
        }
        builder.build()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The top-level keys this condition constrains; used by the dispatcher's
    /// secondary index.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Evaluate this condition against `record`.
    ///
    /// A non-object record never matches (there is nothing to look keys up
    /// in). Deterministic; the only side effects are re-invoking callable
    /// leaves, which is caller-owned.
    pub fn matches(&self, record: &Value) -> bool {
        let Some(object) = record.as_object() else {
            return false;
        };
        for (key, rule) in &self.rules {
            let Some(field) = object.get(key) else {
                return false;
            };
            if !is_truthy(field) {
                return false;
            }
            let matched = match rule {
                RuleNode::Nested(nested) => nested.matches(field),
                RuleNode::AnyOf(leaves) => leaves.iter().any(|leaf| compare(field, leaf)),
                RuleNode::Scalar(leaf) => compare(field, leaf),
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

impl ConditionBuilder {
    pub fn eq(mut self, key: impl Into<String>, target: impl Into<Leaf>) -> Self {
        self.rules.insert(key.into(), RuleNode::Scalar(target.into()));
        self
    }

    pub fn callable(
        self,
        key: impl Into<String>,
        target: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.eq(key, Leaf::Callable(Arc::new(target)))
    }

    pub fn any_of(mut self, key: impl Into<String>, leaves: impl IntoIterator<Item = Leaf>) -> Self {
        self.rules
            .insert(key.into(), RuleNode::AnyOf(leaves.into_iter().collect()));
        self
    }

    pub fn nested(mut self, key: impl Into<String>, condition: Condition) -> Self {
        self.rules.insert(key.into(), RuleNode::Nested(condition));
        self
    }

    pub fn build(self) -> Condition {
        Condition { rules: self.rules }
    }
}

/// Scalar comparison rule: if the record's value is a JSON array, succeed iff
/// the resolved leaf is a member; otherwise succeed iff they are structurally
/// equal.
fn compare(field: &Value, leaf: &Leaf) -> bool {
    let target = leaf.resolve();
    match field {
        Value::Array(items) => items.contains(&target),
        other => *other == target,
    }
}

/// Python-flavored truthiness over JSON values: `null`, `false`, `0`, `""`,
/// `[]`, `{}` are falsy; everything else is truthy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn and_or_nested_matches() {
        let condition = Condition::from_literal(json!({
            "type": "cmd",
            "target": ["x", "y"],
            "meta": { "ok": true },
        }));

        assert!(condition.matches(&json!({ "type": "cmd", "target": "y", "meta": { "ok": true } })));
        assert!(!condition.matches(&json!({ "type": "cmd", "target": "z", "meta": { "ok": true } })));
        assert!(!condition.matches(&json!({ "type": "cmd", "target": "x", "meta": { "ok": false } })));
    }

    #[test]
    fn empty_condition_matches_everything() {
        let condition = Condition::any();
        assert!(condition.matches(&json!({})));
        assert!(condition.matches(&json!({ "anything": 1 })));
    }

    #[test]
    fn missing_or_falsy_key_fails() {
        let condition = Condition::from_literal(json!({ "flag": true }));
        assert!(!condition.matches(&json!({})));
        assert!(!condition.matches(&json!({ "flag": false })));
        assert!(!condition.matches(&json!({ "flag": 0 })));
    }

    #[test]
    fn non_object_record_never_matches() {
        let condition = Condition::from_literal(json!({ "a": 1 }));
        assert!(!condition.matches(&json!([1, 2, 3])));
        assert!(!condition.matches(&Value::Null));
    }

    #[test]
    fn callable_leaf_is_invoked_on_each_match() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let condition = Condition::builder()
            .callable("answer", move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                json!(42)
            })
            .build();

        assert!(condition.matches(&json!({ "answer": 42 })));
        assert!(condition.matches(&json!({ "answer": 42 })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn key_order_does_not_affect_result() {
        let a = Condition::from_literal(json!({ "a": 1, "b": 2 }));
        let b = Condition::from_literal(json!({ "b": 2, "a": 1 }));
        let record = json!({ "a": 1, "b": 2 });
        assert_eq!(a.matches(&record), b.matches(&record));
    }
}
