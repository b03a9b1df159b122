//! In-memory storage backend for development and testing.
//!
//! Implements the subset of MongoDB-style matching and mutation the
//! engine's operator vocabulary covers. Matching is exact-value
//! comparison (with array containment for implicit equality), which is
//! exactly what encrypted selectors need: a deterministic ciphertext
//! equals a stored deterministic ciphertext.

use crate::backend::StorageBackend;
use crate::error::StorageError;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A thread-safe in-memory collection of JSON documents.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    documents: Mutex<Vec<Value>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    /// Whether the backend holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    /// Snapshot of every stored document, bypassing any matching.
    #[must_use]
    pub fn dump(&self) -> Vec<Value> {
        self.documents.lock().clone()
    }
}

impl StorageBackend for MemoryBackend {
    fn find(&self, selector: &Value) -> Result<Vec<Value>, StorageError> {
        let documents = self.documents.lock();
        Ok(documents.iter().filter(|doc| matches(doc, selector)).cloned().collect())
    }

    fn find_one(&self, selector: &Value) -> Result<Option<Value>, StorageError> {
        let documents = self.documents.lock();
        Ok(documents.iter().find(|doc| matches(doc, selector)).cloned())
    }

    fn insert(&self, document: Value) -> Result<Value, StorageError> {
        let Value::Object(mut map) = document else {
            return Err(StorageError::MalformedQuery("insert expects an object".to_string()));
        };
        let id = map
            .entry("_id".to_string())
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
            .clone();
        self.documents.lock().push(Value::Object(map));
        Ok(id)
    }

    fn update(&self, selector: &Value, mutator: &Value) -> Result<usize, StorageError> {
        let mut documents = self.documents.lock();
        let mut changed = 0;
        for doc in documents.iter_mut() {
            if matches(doc, selector) {
                apply_mutator(doc, mutator)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn remove(&self, selector: &Value) -> Result<usize, StorageError> {
        let mut documents = self.documents.lock();
        let before = documents.len();
        documents.retain(|doc| !matches(doc, selector));
        Ok(before - documents.len())
    }
}

/// Whether a document satisfies a selector.
fn matches(doc: &Value, selector: &Value) -> bool {
    let Value::Object(conditions) = selector else {
        return false;
    };
    conditions.iter().all(|(key, condition)| match key.as_str() {
        "$and" => as_expressions(condition).iter().all(|expr| matches(doc, expr)),
        "$or" => as_expressions(condition).iter().any(|expr| matches(doc, expr)),
        "$nor" => !as_expressions(condition).iter().any(|expr| matches(doc, expr)),
        field => field_matches(value_at(doc, field), condition),
    })
}

fn as_expressions(value: &Value) -> &[Value] {
    value.as_array().map_or(&[], Vec::as_slice)
}

fn field_matches(stored: Option<&Value>, condition: &Value) -> bool {
    if let Value::Object(operators) = condition {
        if operators.keys().any(|key| key.starts_with('$')) {
            return operators.iter().all(|(op, operand)| match op.as_str() {
                "$eq" => equality(stored, operand),
                "$ne" => !equality(stored, operand),
                "$in" => as_expressions(operand).iter().any(|v| equality(stored, v)),
                "$nin" => !as_expressions(operand).iter().any(|v| equality(stored, v)),
                "$not" => !field_matches(stored, operand),
                "$exists" => stored.is_some() == operand.as_bool().unwrap_or(false),
                "$size" => stored
                    .and_then(Value::as_array)
                    .is_some_and(|items| Some(items.len() as u64) == operand.as_u64()),
                _ => false,
            });
        }
    }
    equality(stored, condition)
}

/// Implicit equality: exact match, or containment when the stored value
/// is an array.
fn equality(stored: Option<&Value>, expected: &Value) -> bool {
    match stored {
        Some(value) => {
            value == expected
                || value
                    .as_array()
                    .is_some_and(|items| items.iter().any(|item| item == expected))
        }
        None => expected.is_null(),
    }
}

/// Navigates a dotted path through objects and array indices.
fn value_at<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn apply_mutator(doc: &mut Value, mutator: &Value) -> Result<(), StorageError> {
    let Value::Object(operations) = mutator else {
        return Err(StorageError::MalformedQuery("mutator expects an object".to_string()));
    };

    // A mutator without operators is a whole-document replacement.
    if !operations.keys().any(|key| key.starts_with('$')) {
        let id = value_at(doc, "_id").cloned();
        let mut replacement = operations.clone();
        if let Some(id) = id {
            replacement.insert("_id".to_string(), id);
        }
        *doc = Value::Object(replacement);
        return Ok(());
    }

    for (op, fields) in operations {
        let Value::Object(fields) = fields else {
            return Err(StorageError::MalformedQuery(format!("{op} expects an object")));
        };
        for (path, operand) in fields {
            match op.as_str() {
                "$set" => set_at(doc, path, operand.clone()),
                "$unset" => unset_at(doc, path),
                "$inc" => increment_at(doc, path, operand)?,
                "$push" => push_at(doc, path, operand, false)?,
                "$addToSet" => push_at(doc, path, operand, true)?,
                "$pull" => pull_at(doc, path, operand),
                other => {
                    return Err(StorageError::MalformedQuery(format!(
                        "unsupported mutation operator: {other}"
                    )))
                }
            }
        }
    }
    Ok(())
}

/// Steps one segment down, creating a missing intermediate object.
///
/// An in-range numeric segment steps into an existing array; every
/// other case steps into an object, promoting the node if needed.
fn descend_or_create<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    let in_array = matches!(
        value,
        Value::Array(items) if segment.parse::<usize>().is_ok_and(|i| i < items.len())
    );
    if in_array {
        if let Value::Array(items) = value {
            return segment.parse::<usize>().ok().and_then(move |i| items.get_mut(i));
        }
    }
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    if let Value::Object(map) = value {
        return Some(
            map.entry(segment.to_string()).or_insert_with(|| Value::Object(Map::new())),
        );
    }
    None
}

/// Mutable handle on the parent container of a dotted path's last
/// segment, creating intermediates along the way.
fn parent_mut<'a>(doc: &'a mut Value, path: &str) -> Option<(&'a mut Value, String)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop()?.to_string();
    let mut current = doc;
    for segment in segments {
        current = descend_or_create(current, segment)?;
    }
    Some((current, last))
}

fn set_at(doc: &mut Value, path: &str, value: Value) {
    let Some((parent, last)) = parent_mut(doc, path) else { return };
    if let Value::Array(items) = parent {
        if let Ok(index) = last.parse::<usize>() {
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            items[index] = value;
            return;
        }
    }
    if !parent.is_object() {
        *parent = Value::Object(Map::new());
    }
    if let Value::Object(map) = parent {
        map.insert(last, value);
    }
}

fn unset_at(doc: &mut Value, path: &str) {
    let Some((parent, last)) = parent_mut(doc, path) else { return };
    match parent {
        Value::Object(map) => {
            map.remove(&last);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < items.len() {
                    items[index] = Value::Null;
                }
            }
        }
        _ => {}
    }
}

fn increment_at(doc: &mut Value, path: &str, operand: &Value) -> Result<(), StorageError> {
    let step = operand
        .as_f64()
        .ok_or_else(|| StorageError::MalformedQuery("$inc expects a number".to_string()))?;
    let current = value_at(doc, path).and_then(Value::as_f64).unwrap_or(0.0);
    let next = current + step;
    let value = if next.fract() == 0.0 && next.abs() < 9e15 {
        Value::from(next as i64)
    } else {
        Value::from(next)
    };
    set_at(doc, path, value);
    Ok(())
}

fn push_at(
    doc: &mut Value,
    path: &str,
    operand: &Value,
    unique: bool,
) -> Result<(), StorageError> {
    let incoming: Vec<Value> = match operand {
        Value::Object(map) if map.contains_key("$each") => {
            as_expressions(&map["$each"]).to_vec()
        }
        other => vec![other.clone()],
    };

    if value_at(doc, path).is_none() {
        set_at(doc, path, Value::Array(Vec::new()));
    }
    let Some((parent, last)) = parent_mut(doc, path) else {
        return Ok(());
    };
    let Value::Object(map) = parent else {
        return Err(StorageError::MalformedQuery(format!(
            "cannot push below non-object parent at {path}"
        )));
    };
    let target = map.entry(last).or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(items) = target else {
        return Err(StorageError::MalformedQuery(format!("field {path} is not an array")));
    };
    for value in incoming {
        if !unique || !items.contains(&value) {
            items.push(value);
        }
    }
    Ok(())
}

fn pull_at(doc: &mut Value, path: &str, operand: &Value) {
    let Some((parent, last)) = parent_mut(doc, path) else { return };
    if let Value::Object(map) = parent {
        if let Some(Value::Array(items)) = map.get_mut(&last) {
            items.retain(|item| !field_matches(Some(item), operand));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded(docs: Vec<Value>) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for doc in docs {
            backend.insert(doc).unwrap();
        }
        backend
    }

    #[test]
    fn test_insert_assigns_id() {
        let backend = MemoryBackend::new();
        let id = backend.insert(json!({"a": 1})).unwrap();
        assert!(id.is_string());
        let kept = backend.insert(json!({"_id": "fixed", "a": 2})).unwrap();
        assert_eq!(kept, json!("fixed"));
    }

    #[test]
    fn test_find_by_equality() {
        let backend = seeded(vec![json!({"a": 1, "b": "x"}), json!({"a": 2, "b": "y"})]);
        let found = backend.find(&json!({"a": 2})).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["b"], json!("y"));
        assert!(backend.find(&json!({"a": 3})).unwrap().is_empty());
    }

    #[test]
    fn test_empty_selector_matches_all() {
        let backend = seeded(vec![json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(backend.find(&json!({})).unwrap().len(), 2);
    }

    #[test]
    fn test_equality_matches_array_element() {
        let backend = seeded(vec![json!({"tags": ["a", "b"]}), json!({"tags": ["c"]})]);
        let found = backend.find(&json!({"tags": "b"})).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_dotted_path_and_index() {
        let backend = seeded(vec![json!({"profile": {"email": "a@b.c"}, "arr": [10, 20]})]);
        assert_eq!(backend.find(&json!({"profile.email": "a@b.c"})).unwrap().len(), 1);
        assert_eq!(backend.find(&json!({"arr.1": 20})).unwrap().len(), 1);
        assert!(backend.find(&json!({"arr.2": 20})).unwrap().is_empty());
    }

    #[test]
    fn test_operator_matching() {
        let backend = seeded(vec![json!({"a": 1, "arr": [1, 2]}), json!({"a": 2})]);
        assert_eq!(backend.find(&json!({"a": {"$in": [1, 3]}})).unwrap().len(), 1);
        assert_eq!(backend.find(&json!({"a": {"$ne": 1}})).unwrap().len(), 1);
        assert_eq!(backend.find(&json!({"arr": {"$exists": true}})).unwrap().len(), 1);
        assert_eq!(backend.find(&json!({"arr": {"$size": 2}})).unwrap().len(), 1);
        assert_eq!(backend.find(&json!({"a": {"$not": {"$eq": 1}}})).unwrap().len(), 1);
    }

    #[test]
    fn test_logical_combinators() {
        let backend = seeded(vec![json!({"a": 1, "b": 1}), json!({"a": 2, "b": 1})]);
        assert_eq!(
            backend.find(&json!({"$and": [{"a": 1}, {"b": 1}]})).unwrap().len(),
            1
        );
        assert_eq!(
            backend.find(&json!({"$or": [{"a": 1}, {"a": 2}]})).unwrap().len(),
            2
        );
        assert_eq!(backend.find(&json!({"$nor": [{"a": 1}, {"a": 2}]})).unwrap().len(), 0);
    }

    #[test]
    fn test_update_set_and_unset() {
        let backend = seeded(vec![json!({"_id": "1", "a": 1})]);
        let changed = backend
            .update(&json!({"_id": "1"}), &json!({"$set": {"b.c": 2}, "$unset": {"a": 1}}))
            .unwrap();
        assert_eq!(changed, 1);
        let doc = backend.find_one(&json!({"_id": "1"})).unwrap().unwrap();
        assert_eq!(doc, json!({"_id": "1", "b": {"c": 2}}));
    }

    #[test]
    fn test_update_push_each_and_add_to_set() {
        let backend = seeded(vec![json!({"_id": "1", "arr": [1]})]);
        backend
            .update(&json!({"_id": "1"}), &json!({"$push": {"arr": {"$each": [2, 3]}}}))
            .unwrap();
        backend
            .update(&json!({"_id": "1"}), &json!({"$addToSet": {"arr": 2}}))
            .unwrap();
        let doc = backend.find_one(&json!({"_id": "1"})).unwrap().unwrap();
        assert_eq!(doc["arr"], json!([1, 2, 3]));
    }

    #[test]
    fn test_update_pull() {
        let backend = seeded(vec![json!({"_id": "1", "arr": [1, 2, 1]})]);
        backend.update(&json!({"_id": "1"}), &json!({"$pull": {"arr": 1}})).unwrap();
        let doc = backend.find_one(&json!({"_id": "1"})).unwrap().unwrap();
        assert_eq!(doc["arr"], json!([2]));
    }

    #[test]
    fn test_update_inc_passes_through() {
        let backend = seeded(vec![json!({"_id": "1", "n": 4})]);
        backend.update(&json!({"_id": "1"}), &json!({"$inc": {"n": 3}})).unwrap();
        let doc = backend.find_one(&json!({"_id": "1"})).unwrap().unwrap();
        assert_eq!(doc["n"], json!(7));
    }

    #[test]
    fn test_replacement_mutator_keeps_id() {
        let backend = seeded(vec![json!({"_id": "1", "a": 1})]);
        backend.update(&json!({"_id": "1"}), &json!({"b": 2})).unwrap();
        let doc = backend.find_one(&json!({"_id": "1"})).unwrap().unwrap();
        assert_eq!(doc, json!({"_id": "1", "b": 2}));
    }

    #[test]
    fn test_remove() {
        let backend = seeded(vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 1})]);
        let removed = backend.remove(&json!({"a": 1})).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_push_creates_missing_array() {
        let backend = seeded(vec![json!({"_id": "1"})]);
        backend.update(&json!({"_id": "1"}), &json!({"$push": {"arr": 9}})).unwrap();
        let doc = backend.find_one(&json!({"_id": "1"})).unwrap().unwrap();
        assert_eq!(doc["arr"], json!([9]));
    }

    #[test]
    fn test_set_array_index() {
        let backend = seeded(vec![json!({"_id": "1", "arr": [1, 2, 3]})]);
        backend.update(&json!({"_id": "1"}), &json!({"$set": {"arr.1": 9}})).unwrap();
        let doc = backend.find_one(&json!({"_id": "1"})).unwrap().unwrap();
        assert_eq!(doc["arr"], json!([1, 9, 3]));
    }
}
