//! Structural walker: descends a document, selector, or mutator in
//! lock-step with the path schema and the query-operator grammar,
//! applying an injected transform at matched leaves.
//!
//! The walk returns a structurally congruent copy of its input; the
//! original is never mutated. Any transform failure aborts the whole
//! walk, so a storage call never sees a partially-transformed payload.

use crate::client::{
    decode_ciphertext, encode_ciphertext, ClientOptions, EncryptOptions, EncryptionClient,
};
use crate::config::{CallContext, CollectionConfig, FieldOptions, MergedOptions, Operation};
use crate::error::{ProviderError, Result};
use crate::operators::{classify, OperatorKind};
use crate::registry::ProviderRegistry;
use crate::schema::{SchemaMap, SchemaNode, ARRAY_MARKER};
use serde_json::{Map, Value};
use std::sync::Arc;

/// What kind of payload is being walked.
///
/// Operator interpretation and the array-sentinel fallback apply to
/// selectors and mutators, never to stored documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// A stored document (insert input or read result).
    Document,
    /// A query selector.
    Selector,
    /// An update mutator's field map.
    Mutator,
}

impl Payload {
    const fn is_expression(self) -> bool {
        !matches!(self, Self::Document)
    }
}

/// A leaf transform injected into the walk.
pub trait Transform {
    /// Replaces one matched leaf value.
    ///
    /// # Errors
    ///
    /// Any error aborts the surrounding walk.
    fn apply(
        &self,
        client: &Arc<dyn EncryptionClient>,
        options: &MergedOptions,
        value: &Value,
    ) -> Result<Value>;
}

/// One walk over one payload, bound to a resolved configuration.
pub struct Walker<'a> {
    registry: &'a ProviderRegistry,
    connection: &'a str,
    config: &'a CollectionConfig,
    operation: Operation,
    context: CallContext<'a>,
    client_options: ClientOptions,
    transform: &'a dyn Transform,
}

impl<'a> Walker<'a> {
    /// Binds a walk to a resolved configuration and a transform.
    #[must_use]
    pub fn new(
        registry: &'a ProviderRegistry,
        connection: &'a str,
        config: &'a CollectionConfig,
        operation: Operation,
        context: CallContext<'a>,
        transform: &'a dyn Transform,
    ) -> Self {
        let client_options = config.options.client_options();
        Self { registry, connection, config, operation, context, client_options, transform }
    }

    /// Walks a payload, returning the transformed copy.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and serialization failures.
    pub fn walk(&self, value: &Value, payload: Payload) -> Result<Value> {
        self.container(value, Some(self.config.schema.root()), payload)
    }

    fn container(
        &self,
        value: &Value,
        node: Option<&SchemaMap>,
        payload: Payload,
    ) -> Result<Value> {
        match value {
            Value::Object(map) => self.object(map, node, payload),
            Value::Array(items) => {
                let walked: Result<Vec<Value>> = items
                    .iter()
                    .map(|item| self.field_value(node, ARRAY_MARKER, item, payload))
                    .collect();
                Ok(Value::Array(walked?))
            }
            scalar => Ok(scalar.clone()),
        }
    }

    fn object(
        &self,
        map: &Map<String, Value>,
        node: Option<&SchemaMap>,
        payload: Payload,
    ) -> Result<Value> {
        let mut out = Map::new();
        for (key, value) in map {
            let walked = match classify(key).filter(|_| payload.is_expression()) {
                Some(OperatorKind::Passthrough) => value.clone(),
                Some(OperatorKind::Logical) => self.branches(value, node, payload)?,
                Some(OperatorKind::NestedSet) => self.set_operand(value, node, None, payload)?,
                Some(OperatorKind::NestedValue) => self.operand(value, node, None, payload)?,
                None => self.field_value(node, key, value, payload)?,
            };
            out.insert(key.clone(), walked);
        }
        Ok(Value::Object(out))
    }

    /// An operator whose value is a sequence of sub-expressions; the
    /// field path has not advanced, so each is walked with the same
    /// schema node.
    fn branches(&self, value: &Value, node: Option<&SchemaMap>, payload: Payload) -> Result<Value> {
        match value {
            Value::Array(items) => {
                let walked: Result<Vec<Value>> =
                    items.iter().map(|expr| self.container(expr, node, payload)).collect();
                Ok(Value::Array(walked?))
            }
            other => self.container(other, node, payload),
        }
    }

    /// A set-style operator: every element of the sequence is walked as
    /// if it were the field's value itself.
    fn set_operand(
        &self,
        value: &Value,
        node: Option<&SchemaMap>,
        field: Option<&str>,
        payload: Payload,
    ) -> Result<Value> {
        match value {
            Value::Array(items) => {
                let walked: Result<Vec<Value>> =
                    items.iter().map(|item| self.operand(item, node, field, payload)).collect();
                Ok(Value::Array(walked?))
            }
            other => self.operand(other, node, field, payload),
        }
    }

    /// One operand in a field's value position.
    fn operand(
        &self,
        value: &Value,
        node: Option<&SchemaMap>,
        field: Option<&str>,
        payload: Payload,
    ) -> Result<Value> {
        match field {
            Some(key) => self.field_value(node, key, value, payload),
            None => self.container(value, node, payload),
        }
    }

    /// An operator container sitting under a field key: the key stays
    /// the field-path context, the schema is not descended by it.
    fn operator_object(
        &self,
        node: Option<&SchemaMap>,
        field: &str,
        map: &Map<String, Value>,
        payload: Payload,
    ) -> Result<Value> {
        let mut out = Map::new();
        for (op_key, op_value) in map {
            let walked = match classify(op_key) {
                Some(OperatorKind::Passthrough) => op_value.clone(),
                Some(OperatorKind::Logical) => self.branches(op_value, node, payload)?,
                Some(OperatorKind::NestedSet) => {
                    self.set_operand(op_value, node, Some(field), payload)?
                }
                Some(OperatorKind::NestedValue) => {
                    self.operand(op_value, node, Some(field), payload)?
                }
                None => op_value.clone(),
            };
            out.insert(op_key.clone(), walked);
        }
        Ok(Value::Object(out))
    }

    fn field_value(
        &self,
        node: Option<&SchemaMap>,
        key: &str,
        value: &Value,
        payload: Payload,
    ) -> Result<Value> {
        if payload.is_expression() {
            if let Value::Object(map) = value {
                if map.keys().any(|op_key| classify(op_key).is_some()) {
                    return self.operator_object(node, key, map, payload);
                }
            }
        }

        let lookup_key = if is_index_key(key) { ARRAY_MARKER } else { key };
        if let Some(options) = self.resolve_options(node, lookup_key, value, payload)? {
            return self.apply(&options, value);
        }

        if matches!(value, Value::Object(_) | Value::Array(_)) {
            let advanced = node.and_then(|map| match map.lookup(lookup_key) {
                Some(SchemaNode::Branch(sub)) => Some(sub),
                Some(SchemaNode::Leaf(_)) | None => None,
            });
            return match advanced {
                Some(sub) => self.container(value, Some(sub), payload),
                None => Ok(value.clone()),
            };
        }

        Ok(value.clone())
    }

    fn resolve_options(
        &self,
        node: Option<&SchemaMap>,
        key: &str,
        value: &Value,
        payload: Payload,
    ) -> Result<Option<FieldOptions>> {
        let Some(map) = node else { return Ok(None) };
        match map.lookup(key) {
            Some(SchemaNode::Leaf(leaf)) => leaf.options(self.operation, &self.context),
            Some(SchemaNode::Branch(sub)) => {
                // A selector or mutator naming the field directly may
                // still hit the per-element form: `{field: x}` matches
                // one element of the stored array when the schema only
                // declares `field.$`.
                if payload.is_expression() && !value.is_array() {
                    if let Some(SchemaNode::Leaf(leaf)) = sub.get(ARRAY_MARKER) {
                        return leaf.options(self.operation, &self.context);
                    }
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn apply(&self, options: &FieldOptions, value: &Value) -> Result<Value> {
        let merged = self.config.options.merge(options);
        let client = self.registry.client(self.connection, &self.client_options)?;
        self.transform.apply(&client, &merged, value)
    }
}

fn is_index_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|byte| byte.is_ascii_digit())
}

/// Encrypting transform: serializes the leaf value, makes sure the data
/// key behind the merged alias exists, and seals the ciphertext into
/// the in-document marker form.
pub struct EncryptTransform<'a> {
    registry: &'a ProviderRegistry,
    connection: &'a str,
    client_options: ClientOptions,
}

impl<'a> EncryptTransform<'a> {
    /// Binds the transform to the registry entry the walk uses.
    #[must_use]
    pub fn new(
        registry: &'a ProviderRegistry,
        connection: &'a str,
        client_options: ClientOptions,
    ) -> Self {
        Self { registry, connection, client_options }
    }
}

impl Transform for EncryptTransform<'_> {
    fn apply(
        &self,
        client: &Arc<dyn EncryptionClient>,
        options: &MergedOptions,
        value: &Value,
    ) -> Result<Value> {
        self.registry.data_key(
            self.connection,
            &self.client_options,
            &options.provider,
            options.master_key.as_ref(),
            &options.key_alt_name,
        )?;
        let plaintext = serde_json::to_vec(value)?;
        let encrypt_options = EncryptOptions {
            key_alt_name: options.key_alt_name.clone(),
            algorithm: options.algorithm,
        };
        let ciphertext = client.encrypt(&plaintext, &encrypt_options)?;
        Ok(encode_ciphertext(&ciphertext))
    }
}

/// Decrypting transform: unseals the marker form back to the plaintext
/// value. With `safe` set, values not in encrypted form pass through.
pub struct DecryptTransform;

impl Transform for DecryptTransform {
    fn apply(
        &self,
        client: &Arc<dyn EncryptionClient>,
        options: &MergedOptions,
        value: &Value,
    ) -> Result<Value> {
        match decode_ciphertext(value) {
            Some(ciphertext) => {
                let plaintext = client.decrypt(&ciphertext)?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
            None if options.safe => Ok(value.clone()),
            None => Err(ProviderError::NotEncrypted.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientFactory, DataKeyOptions, KeyRecord};
    use crate::config::{EncryptionConfig, FieldOptions};
    use crate::schema::{FieldSchema, FieldSpec};
    use serde_json::json;
    use std::sync::Arc;

    /// Reversible stand-in cipher: `v` becomes `{"$cipher": b64(json)}`.
    struct StubClient;

    impl EncryptionClient for StubClient {
        fn encrypt(
            &self,
            plaintext: &[u8],
            _options: &EncryptOptions,
        ) -> Result<Vec<u8>, ProviderError> {
            Ok(plaintext.to_vec())
        }

        fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProviderError> {
            Ok(ciphertext.to_vec())
        }

        fn create_data_key(
            &self,
            _provider: &str,
            _options: &DataKeyOptions,
        ) -> Result<String, ProviderError> {
            Ok("stub_key".to_string())
        }

        fn vault_keys(&self) -> Result<Vec<KeyRecord>, ProviderError> {
            Ok(Vec::new())
        }
    }

    struct StubFactory;

    impl ClientFactory for StubFactory {
        fn create(
            &self,
            _options: &ClientOptions,
        ) -> Result<Arc<dyn EncryptionClient>, ProviderError> {
            Ok(Arc::new(StubClient))
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(StubFactory))
    }

    fn config(entries: Vec<(&str, FieldSpec)>) -> CollectionConfig {
        CollectionConfig::new(EncryptionConfig::new(), FieldSchema::build(entries).unwrap())
    }

    fn encrypt(config: &CollectionConfig, value: &Value, payload: Payload) -> Value {
        let registry = registry();
        let transform =
            EncryptTransform::new(&registry, "conn", config.options.client_options());
        let walker = Walker::new(
            &registry,
            "conn",
            config,
            Operation::Find,
            CallContext::default(),
            &transform,
        );
        walker.walk(value, payload).unwrap()
    }

    fn sealed(value: &Value) -> Value {
        encode_ciphertext(&serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn test_scalar_field_encrypted() {
        let config = config(vec![("ssn", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"ssn": "123-45-6789", "name": "a"}), Payload::Document);
        assert_eq!(out, json!({"ssn": sealed(&json!("123-45-6789")), "name": "a"}));
    }

    #[test]
    fn test_nested_field_encrypted() {
        let config = config(vec![("profile.email", FieldSpec::Enabled)]);
        let out = encrypt(
            &config,
            &json!({"profile": {"email": "a@b.c", "age": 3}}),
            Payload::Document,
        );
        assert_eq!(out, json!({"profile": {"email": sealed(&json!("a@b.c")), "age": 3}}));
    }

    #[test]
    fn test_array_elements_encrypted_independently() {
        let config = config(vec![("array.$", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"array": [1, 2, 3]}), Payload::Document);
        let expected =
            json!({"array": [sealed(&json!(1)), sealed(&json!(2)), sealed(&json!(3))]});
        assert_eq!(out, expected);
    }

    #[test]
    fn test_wildcard_matches_unknown_subkeys_only() {
        let config = config(vec![("object.*", FieldSpec::Enabled)]);
        let out = encrypt(
            &config,
            &json!({"object": {"x": 1, "y": 2}, "other": 3}),
            Payload::Document,
        );
        assert_eq!(
            out,
            json!({"object": {"x": sealed(&json!(1)), "y": sealed(&json!(2))}, "other": 3})
        );
    }

    #[test]
    fn test_whole_object_field_encrypted_as_one_value() {
        let config = config(vec![("secret", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"secret": {"a": 1, "b": [2]}}), Payload::Document);
        assert_eq!(out, json!({"secret": sealed(&json!({"a": 1, "b": [2]}))}));
    }

    #[test]
    fn test_passthrough_operators_untouched() {
        let config = config(vec![("ssn", FieldSpec::Enabled)]);
        let selector = json!({"ssn": {"$exists": true, "$size": 2}});
        let out = encrypt(&config, &selector, Payload::Selector);
        assert_eq!(out, selector);
    }

    #[test]
    fn test_logical_operator_branches_walked() {
        let config = config(vec![("ssn", FieldSpec::Enabled)]);
        let out = encrypt(
            &config,
            &json!({"$or": [{"ssn": "a"}, {"plain": "b"}]}),
            Payload::Selector,
        );
        assert_eq!(out, json!({"$or": [{"ssn": sealed(&json!("a"))}, {"plain": "b"}]}));
    }

    #[test]
    fn test_in_operator_wraps_each_element() {
        let config = config(vec![("ssn", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"ssn": {"$in": ["a", "b"]}}), Payload::Selector);
        assert_eq!(
            out,
            json!({"ssn": {"$in": [sealed(&json!("a")), sealed(&json!("b"))]}})
        );
    }

    #[test]
    fn test_not_wrapping_operator_expression() {
        let config = config(vec![("ssn", FieldSpec::Enabled)]);
        let out = encrypt(
            &config,
            &json!({"ssn": {"$not": {"$eq": "a"}}}),
            Payload::Selector,
        );
        assert_eq!(out, json!({"ssn": {"$not": {"$eq": sealed(&json!("a"))}}}));
    }

    #[test]
    fn test_ne_value_encrypted_in_place() {
        let config = config(vec![("ssn", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"ssn": {"$ne": "a"}}), Payload::Selector);
        assert_eq!(out, json!({"ssn": {"$ne": sealed(&json!("a"))}}));
    }

    #[test]
    fn test_selector_scalar_falls_back_to_array_leaf() {
        let config = config(vec![("array.$", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"array": 2}), Payload::Selector);
        assert_eq!(out, json!({"array": sealed(&json!(2))}));
    }

    #[test]
    fn test_document_scalar_does_not_fall_back() {
        let config = config(vec![("array.$", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"array": 2}), Payload::Document);
        assert_eq!(out, json!({"array": 2}));
    }

    #[test]
    fn test_array_literal_selector_encrypts_per_element() {
        let config = config(vec![("array.$", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"array": [1, 2]}), Payload::Selector);
        assert_eq!(out, json!({"array": [sealed(&json!(1)), sealed(&json!(2))]}));
    }

    #[test]
    fn test_each_wrapper_in_mutator() {
        let config = config(vec![("array.$", FieldSpec::Enabled)]);
        let out = encrypt(
            &config,
            &json!({"array": {"$each": [1, 2]}}),
            Payload::Mutator,
        );
        assert_eq!(
            out,
            json!({"array": {"$each": [sealed(&json!(1)), sealed(&json!(2))]}})
        );
    }

    #[test]
    fn test_mutator_scalar_push_falls_back_to_array_leaf() {
        let config = config(vec![("array.$", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"array": 5}), Payload::Mutator);
        assert_eq!(out, json!({"array": sealed(&json!(5))}));
    }

    #[test]
    fn test_dotted_key_resolved_through_trie() {
        let config = config(vec![("profile.email", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"profile.email": "a@b.c"}), Payload::Mutator);
        assert_eq!(out, json!({"profile.email": sealed(&json!("a@b.c"))}));
    }

    #[test]
    fn test_integer_index_key_uses_array_marker() {
        let config = config(vec![("array.$", FieldSpec::Enabled)]);
        let out = encrypt(&config, &json!({"array.0": 7}), Payload::Mutator);
        assert_eq!(out, json!({"array.0": sealed(&json!(7))}));
    }

    #[test]
    fn test_unmatched_fields_copied() {
        let config = config(vec![("ssn", FieldSpec::Enabled)]);
        let doc = json!({"a": 1, "b": {"c": [1, 2]}, "d": null});
        assert_eq!(encrypt(&config, &doc, Payload::Document), doc);
    }

    #[test]
    fn test_decrypt_round_trip() {
        let config = config(vec![
            ("ssn", FieldSpec::Enabled),
            ("array.$", FieldSpec::Enabled),
            ("profile.email", FieldSpec::Enabled),
        ]);
        let doc = json!({
            "ssn": "123",
            "array": [1, 2],
            "profile": {"email": "a@b.c"},
            "plain": true,
        });

        let registry = registry();
        let transform =
            EncryptTransform::new(&registry, "conn", config.options.client_options());
        let walker = Walker::new(
            &registry,
            "conn",
            &config,
            Operation::Insert,
            CallContext::default(),
            &transform,
        );
        let encrypted = walker.walk(&doc, Payload::Document).unwrap();
        assert_ne!(encrypted, doc);

        let decrypt = DecryptTransform;
        let walker = Walker::new(
            &registry,
            "conn",
            &config,
            Operation::Find,
            CallContext::default(),
            &decrypt,
        );
        let decrypted = walker.walk(&encrypted, Payload::Document).unwrap();
        assert_eq!(decrypted, doc);
    }

    #[test]
    fn test_decrypt_plaintext_value_fails_without_safe() {
        let config = config(vec![("ssn", FieldSpec::Enabled)]);
        let registry = registry();
        let walker = Walker::new(
            &registry,
            "conn",
            &config,
            Operation::Find,
            CallContext::default(),
            &DecryptTransform,
        );
        let err = walker.walk(&json!({"ssn": "plain"}), Payload::Document).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Provider(ProviderError::NotEncrypted)
        ));
    }

    #[test]
    fn test_decrypt_plaintext_value_passes_with_safe() {
        let options = EncryptionConfig { safe: true, ..EncryptionConfig::default() };
        let config = CollectionConfig::new(
            options,
            FieldSchema::build(vec![("ssn", FieldSpec::Enabled)]).unwrap(),
        );
        let registry = registry();
        let walker = Walker::new(
            &registry,
            "conn",
            &config,
            Operation::Find,
            CallContext::default(),
            &DecryptTransform,
        );
        let doc = json!({"ssn": "plain"});
        assert_eq!(walker.walk(&doc, Payload::Document).unwrap(), doc);
    }

    #[test]
    fn test_field_resolver_sees_operation() {
        let schema = FieldSchema::build(vec![(
            "ssn",
            FieldSpec::resolver(|operation, _context| {
                Ok((operation == Operation::Insert).then(FieldOptions::default))
            }),
        )])
        .unwrap();
        let config = CollectionConfig::new(EncryptionConfig::new(), schema);

        let registry = registry();
        let transform =
            EncryptTransform::new(&registry, "conn", config.options.client_options());
        let doc = json!({"ssn": "x"});

        let walker = Walker::new(
            &registry,
            "conn",
            &config,
            Operation::Insert,
            CallContext::default(),
            &transform,
        );
        assert_ne!(walker.walk(&doc, Payload::Document).unwrap(), doc);

        let walker = Walker::new(
            &registry,
            "conn",
            &config,
            Operation::Find,
            CallContext::default(),
            &transform,
        );
        assert_eq!(walker.walk(&doc, Payload::Document).unwrap(), doc);
    }
}
