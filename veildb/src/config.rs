//! Encryption configuration: global options, per-field options, and the
//! per-call context handed to dynamic resolvers.
//!
//! A [`CollectionConfig`] pairs the global [`EncryptionConfig`] with a
//! [`FieldSchema`](crate::schema::FieldSchema). It is resolved once per
//! operation (or per result document for dynamic configurations) and is
//! never mutated in place: reconfiguration replaces it wholesale.

use crate::client::ClientOptions;
use crate::error::Result;
use crate::schema::FieldSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// The operation that triggered a schema or field resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read by selector, returning a cursor.
    Find,
    /// Read a single document by selector.
    FindOne,
    /// Insert a document.
    Insert,
    /// Update documents matching a selector with a mutator.
    Update,
    /// Remove documents matching a selector.
    Remove,
}

impl Operation {
    /// Returns the operation name as used in logs and resolver contexts.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::FindOne => "findOne",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encryption algorithm selector.
///
/// `Deterministic` produces equal ciphertexts for equal plaintexts under
/// the same data key, which makes equality selectors work against stored
/// ciphertexts. `Random` is semantically secure but not queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Deterministic AEAD; required for fields used in equality selectors.
    #[default]
    Deterministic,
    /// Randomized AEAD; required for whole-object and whole-array fields.
    Random,
}

/// Per-field encryption options, as stored in a schema leaf or returned
/// by a field resolver.
///
/// Every field is optional; unset fields fall back to the call's global
/// [`EncryptionConfig`] when merged.
#[derive(Clone, Default, PartialEq)]
pub struct FieldOptions {
    /// Alias of the data key used for this field.
    pub key_alt_name: Option<String>,
    /// Algorithm override for this field.
    pub algorithm: Option<Algorithm>,
    /// KMS provider name override for this field.
    pub provider: Option<String>,
    /// Master key descriptor used when the data key must be created.
    pub master_key: Option<Value>,
}

impl FieldOptions {
    /// Creates empty options; all values defer to the global config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the data-key alias.
    #[must_use]
    pub fn with_key_alt_name(mut self, alias: impl Into<String>) -> Self {
        self.key_alt_name = Some(alias.into());
        self
    }

    /// Sets the algorithm.
    #[must_use]
    pub const fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Sets the KMS provider name.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the master key descriptor.
    #[must_use]
    pub fn with_master_key(mut self, master_key: Value) -> Self {
        self.master_key = Some(master_key);
        self
    }
}

impl fmt::Debug for FieldOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldOptions")
            .field("key_alt_name", &self.key_alt_name)
            .field("algorithm", &self.algorithm)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Global encryption options for a collection.
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    /// Namespace of the key vault collection, e.g. `"encryption.keys"`.
    pub key_vault_namespace: Option<String>,
    /// KMS provider configurations, keyed by provider name.
    pub kms_providers: Option<Value>,
    /// Default master key descriptor for data-key creation.
    pub master_key: Option<Value>,
    /// Default data-key alias.
    pub key_alt_name: Option<String>,
    /// Default algorithm.
    pub algorithm: Option<Algorithm>,
    /// Default KMS provider name.
    pub provider: Option<String>,
    /// When set, decrypt transforms pass through values that are not in
    /// encrypted form instead of failing.
    pub safe: bool,
}

/// Default data-key alias when neither the field nor the global config
/// names one.
pub const DEFAULT_KEY_ALT_NAME: &str = "default";

/// Default KMS provider name.
pub const DEFAULT_PROVIDER: &str = "local";

impl EncryptionConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges per-field options over this configuration, producing the
    /// effective options for a single transform.
    #[must_use]
    pub fn merge(&self, field: &FieldOptions) -> MergedOptions {
        MergedOptions {
            key_alt_name: field
                .key_alt_name
                .clone()
                .or_else(|| self.key_alt_name.clone())
                .unwrap_or_else(|| DEFAULT_KEY_ALT_NAME.to_string()),
            algorithm: field.algorithm.or(self.algorithm).unwrap_or_default(),
            provider: field
                .provider
                .clone()
                .or_else(|| self.provider.clone())
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            master_key: field.master_key.clone().or_else(|| self.master_key.clone()),
            safe: self.safe,
        }
    }

    /// Extracts the client-construction options from this configuration.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            key_vault_namespace: self.key_vault_namespace.clone(),
            kms_providers: self.kms_providers.clone(),
        }
    }
}

/// Effective options for a single leaf transform, produced by merging
/// field options over the call's global configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedOptions {
    /// Alias of the data key to encrypt with.
    pub key_alt_name: String,
    /// Algorithm to encrypt with.
    pub algorithm: Algorithm,
    /// KMS provider name.
    pub provider: String,
    /// Master key descriptor for lazy data-key creation.
    pub master_key: Option<Value>,
    /// Decrypt tolerance for plaintext values.
    pub safe: bool,
}

/// Borrowed view of the payloads of the operation currently being
/// transformed, handed to dynamic resolvers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext<'a> {
    /// The selector, for read/update/remove operations.
    pub selector: Option<&'a Value>,
    /// The document, for inserts and per-result-document resolution.
    pub document: Option<&'a Value>,
    /// The mutator, for update operations.
    pub mutator: Option<&'a Value>,
}

impl<'a> CallContext<'a> {
    /// Context carrying only a selector.
    #[must_use]
    pub const fn for_selector(selector: &'a Value) -> Self {
        Self { selector: Some(selector), document: None, mutator: None }
    }

    /// Context carrying only a document.
    #[must_use]
    pub const fn for_document(document: &'a Value) -> Self {
        Self { selector: None, document: Some(document), mutator: None }
    }
}

/// A complete per-collection encryption configuration: global options
/// plus the active field schema.
#[derive(Debug)]
pub struct CollectionConfig {
    /// Global options applied beneath every field's own options.
    pub options: EncryptionConfig,
    /// The conflict-checked path schema.
    pub schema: FieldSchema,
}

impl CollectionConfig {
    /// Pairs a schema with its global options.
    #[must_use]
    pub const fn new(options: EncryptionConfig, schema: FieldSchema) -> Self {
        Self { options, schema }
    }
}

/// Per-call resolver for dynamic encryption configuration.
///
/// Returning `Ok(None)` means the operation runs without encryption.
/// Errors are propagated to the caller of the triggering operation.
pub type ConfigResolver =
    dyn Fn(Operation, &CallContext<'_>) -> Result<Option<Arc<CollectionConfig>>> + Send + Sync;

/// How a collection obtains its encryption configuration.
#[derive(Clone)]
pub enum ConfigSource {
    /// One fixed configuration for every call.
    Static(Arc<CollectionConfig>),
    /// A resolver invoked per operation (and per result document).
    Dynamic(Arc<ConfigResolver>),
}

impl ConfigSource {
    /// Wraps a fixed configuration.
    #[must_use]
    pub fn fixed(config: CollectionConfig) -> Self {
        Self::Static(Arc::new(config))
    }

    /// Wraps a per-call resolver function.
    pub fn resolver<F>(resolver: F) -> Self
    where
        F: Fn(Operation, &CallContext<'_>) -> Result<Option<Arc<CollectionConfig>>>
            + Send
            + Sync
            + 'static,
    {
        Self::Dynamic(Arc::new(resolver))
    }
}

impl fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(config) => f.debug_tuple("Static").field(config).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_field_options() {
        let config = EncryptionConfig {
            key_alt_name: Some("global".to_string()),
            algorithm: Some(Algorithm::Random),
            provider: Some("aws".to_string()),
            ..EncryptionConfig::default()
        };
        let field = FieldOptions::new()
            .with_key_alt_name("field")
            .with_algorithm(Algorithm::Deterministic);

        let merged = config.merge(&field);
        assert_eq!(merged.key_alt_name, "field");
        assert_eq!(merged.algorithm, Algorithm::Deterministic);
        assert_eq!(merged.provider, "aws");
    }

    #[test]
    fn test_merge_defaults() {
        let merged = EncryptionConfig::new().merge(&FieldOptions::new());
        assert_eq!(merged.key_alt_name, DEFAULT_KEY_ALT_NAME);
        assert_eq!(merged.algorithm, Algorithm::Deterministic);
        assert_eq!(merged.provider, DEFAULT_PROVIDER);
        assert!(merged.master_key.is_none());
        assert!(!merged.safe);
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Find.name(), "find");
        assert_eq!(Operation::FindOne.name(), "findOne");
        assert_eq!(Operation::Update.to_string(), "update");
    }
}
