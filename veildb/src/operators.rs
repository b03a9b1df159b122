//! The fixed selector/mutator operator vocabulary.
//!
//! Operators are represented as a closed tagged enum evaluated by
//! exhaustive pattern match. An unrecognized `$`-prefixed key is simply
//! not an operator: the walker treats it as an ordinary field name.

use serde_json::Value;

/// Traversal category of a supported query operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    /// Constrains shape, not value; copied verbatim (`$exists`, `$size`).
    Passthrough,
    /// Carries a sequence of sub-expressions, each walked with the same
    /// schema node (`$and`, `$or`, `$nor`).
    Logical,
    /// Carries a sequence whose every element is walked as if it were
    /// the field's value itself (`$in`, `$nin`, `$each`).
    NestedSet,
    /// Carries one bare value or sub-expression walked in the field's
    /// value position (`$eq`, `$ne`, `$not`).
    NestedValue,
}

/// Classifies a key against the supported operator vocabulary.
///
/// Returns `None` for every key outside the fixed set, including
/// unrecognized `$`-prefixed ones.
#[must_use]
pub fn classify(key: &str) -> Option<OperatorKind> {
    match key {
        "$exists" | "$size" => Some(OperatorKind::Passthrough),
        "$and" | "$or" | "$nor" => Some(OperatorKind::Logical),
        "$in" | "$nin" | "$each" => Some(OperatorKind::NestedSet),
        "$eq" | "$ne" | "$not" => Some(OperatorKind::NestedValue),
        _ => None,
    }
}

/// Whether a value is a plain object with at least one supported
/// operator among its keys.
///
/// Such an object is an operator container for the key it sits under:
/// the walker keeps the current field-path context instead of
/// descending the schema by that key.
#[must_use]
pub fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.keys().any(|key| classify(key).is_some()),
        _ => false,
    }
}
