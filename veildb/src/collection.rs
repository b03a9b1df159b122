//! Operation facade: an explicit decorator composed around a storage
//! backend, one per collection.
//!
//! Each entry point resolves the (possibly dynamic) encryption
//! configuration for the call, drives the walker over the payload in
//! encrypt mode, delegates to the backend, and for reads re-runs the
//! walker in decrypt mode over each result document. When no
//! configuration resolves, the call delegates unmodified: the wrapper
//! costs nothing for unencrypted collections.

use crate::backend::StorageBackend;
use crate::config::{CallContext, CollectionConfig, ConfigSource, Operation};
use crate::error::Result;
use crate::registry::ProviderRegistry;
use crate::walker::{DecryptTransform, EncryptTransform, Payload, Walker};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Mutation operators whose field maps are transformed; everything else
/// passes through to the backend untouched.
const TRANSFORMED_MUTATIONS: [&str; 4] = ["$set", "$push", "$addToSet", "$pull"];

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    /// Reuse the call-level resolved configuration for every result
    /// document instead of re-resolving per document.
    ///
    /// Only sound when the dynamic resolver is selector-invariant
    /// across all matching documents; with a static configuration it
    /// changes nothing.
    pub fast_auto_encryption: bool,
}

impl FindOptions {
    /// Options with the fast path enabled.
    #[must_use]
    pub const fn fast() -> Self {
        Self { fast_auto_encryption: true }
    }
}

/// A storage collection with schema-driven field-level encryption
/// layered over it.
pub struct EncryptedCollection<B> {
    name: String,
    connection: String,
    backend: Arc<B>,
    registry: Arc<ProviderRegistry>,
    source: RwLock<Option<ConfigSource>>,
}

impl<B: StorageBackend> EncryptedCollection<B> {
    /// Wraps a backend. Until [`configure_encryption`]
    /// (Self::configure_encryption) is called, every operation
    /// delegates unmodified.
    #[must_use]
    pub fn new(name: impl Into<String>, backend: Arc<B>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            name: name.into(),
            connection: "default".to_string(),
            backend,
            registry,
            source: RwLock::new(None),
        }
    }

    /// Names the connection this collection belongs to; client cache
    /// entries are scoped to it.
    #[must_use]
    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    /// The collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Installs the encryption configuration, replacing any previous
    /// one wholesale.
    pub fn configure_encryption(&self, source: ConfigSource) {
        *self.source.write() = Some(source);
    }

    /// Removes the encryption configuration; subsequent operations
    /// delegate unmodified.
    pub fn clear_encryption(&self) {
        *self.source.write() = None;
    }

    /// Inserts a document, encrypting schema-designated fields first.
    ///
    /// Returns the stored document's identifier.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and backend failures. The backend
    /// is not called when any leaf transform fails.
    pub fn insert(&self, document: &Value) -> Result<Value> {
        let context = CallContext::for_document(document);
        let Some(config) = self.resolve_config(Operation::Insert, &context)? else {
            return Ok(self.backend.insert(document.clone())?);
        };
        debug!(collection = %self.name, "encrypting document for insert");
        let encrypted =
            self.encrypt_payload(&config, Operation::Insert, context, document, Payload::Document)?;
        Ok(self.backend.insert(encrypted)?)
    }

    /// Finds documents by selector, returning a decrypting cursor.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and backend failures.
    pub fn find(&self, selector: &Value) -> Result<Cursor<'_, B>> {
        self.find_with_options(selector, FindOptions::default())
    }

    /// [`find`](Self::find) with explicit options.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and backend failures.
    pub fn find_with_options(
        &self,
        selector: &Value,
        options: FindOptions,
    ) -> Result<Cursor<'_, B>> {
        let context = CallContext::for_selector(selector);
        let config = self.resolve_config(Operation::Find, &context)?;
        let documents = match &config {
            Some(config) => {
                let encrypted = self.encrypt_payload(
                    config,
                    Operation::Find,
                    context,
                    selector,
                    Payload::Selector,
                )?;
                self.backend.find(&encrypted)?
            }
            None => self.backend.find(selector)?,
        };
        Ok(Cursor {
            collection: self,
            selector: selector.clone(),
            documents,
            config,
            fast: options.fast_auto_encryption,
        })
    }

    /// Finds a single document by selector, decrypted.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and backend failures.
    pub fn find_one(&self, selector: &Value) -> Result<Option<Value>> {
        self.find_one_with_options(selector, FindOptions::default())
    }

    /// [`find_one`](Self::find_one) with explicit options.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and backend failures.
    pub fn find_one_with_options(
        &self,
        selector: &Value,
        options: FindOptions,
    ) -> Result<Option<Value>> {
        let context = CallContext::for_selector(selector);
        let config = self.resolve_config(Operation::FindOne, &context)?;
        let found = match &config {
            Some(config) => {
                let encrypted = self.encrypt_payload(
                    config,
                    Operation::FindOne,
                    context,
                    selector,
                    Payload::Selector,
                )?;
                self.backend.find_one(&encrypted)?
            }
            None => self.backend.find_one(selector)?,
        };
        let Some(document) = found else { return Ok(None) };
        let Some(call_config) = config else { return Ok(Some(document)) };

        let document_config = if options.fast_auto_encryption {
            Some(call_config)
        } else {
            self.resolve_for_document(Operation::FindOne, selector, &document)?
        };
        match document_config {
            Some(config) => Ok(Some(self.decrypt_document(&config, selector, &document)?)),
            None => Ok(Some(document)),
        }
    }

    /// Finds a single document by its identifier.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and backend failures.
    pub fn find_by_id(&self, id: &Value) -> Result<Option<Value>> {
        self.find_one(&json!({ "_id": id }))
    }

    /// Updates documents matching a selector.
    ///
    /// Only `$set`, `$push`, `$addToSet`, and `$pull` field maps are
    /// transformed; every other mutation operator passes through
    /// unchanged. The dynamic resolver is consulted twice: once for the
    /// selector, once for the mutator.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and backend failures.
    pub fn update(&self, selector: &Value, mutator: &Value) -> Result<usize> {
        let selector_context = CallContext::for_selector(selector);
        let encrypted_selector =
            match self.resolve_config(Operation::Update, &selector_context)? {
                Some(config) => self.encrypt_payload(
                    &config,
                    Operation::Update,
                    selector_context,
                    selector,
                    Payload::Selector,
                )?,
                None => selector.clone(),
            };

        let mutator_context = CallContext {
            selector: Some(selector),
            document: None,
            mutator: Some(mutator),
        };
        let encrypted_mutator = match self.resolve_config(Operation::Update, &mutator_context)? {
            Some(config) => self.encrypt_mutator(&config, mutator_context, mutator)?,
            None => mutator.clone(),
        };

        Ok(self.backend.update(&encrypted_selector, &encrypted_mutator)?)
    }

    /// Removes documents matching a selector.
    ///
    /// # Errors
    ///
    /// Propagates resolver, provider, and backend failures.
    pub fn remove(&self, selector: &Value) -> Result<usize> {
        let context = CallContext::for_selector(selector);
        let Some(config) = self.resolve_config(Operation::Remove, &context)? else {
            return Ok(self.backend.remove(selector)?);
        };
        let encrypted =
            self.encrypt_payload(&config, Operation::Remove, context, selector, Payload::Selector)?;
        Ok(self.backend.remove(&encrypted)?)
    }

    fn resolve_config(
        &self,
        operation: Operation,
        context: &CallContext<'_>,
    ) -> Result<Option<Arc<CollectionConfig>>> {
        let source = self.source.read();
        match source.as_ref() {
            None => Ok(None),
            Some(ConfigSource::Static(config)) => Ok(Some(Arc::clone(config))),
            Some(ConfigSource::Dynamic(resolve)) => resolve(operation, context),
        }
    }

    /// Per-result-document resolution; static configurations are reused
    /// without a resolver round-trip.
    fn resolve_for_document(
        &self,
        operation: Operation,
        selector: &Value,
        document: &Value,
    ) -> Result<Option<Arc<CollectionConfig>>> {
        let source = self.source.read();
        match source.as_ref() {
            None => Ok(None),
            Some(ConfigSource::Static(config)) => Ok(Some(Arc::clone(config))),
            Some(ConfigSource::Dynamic(resolve)) => {
                let context = CallContext {
                    selector: Some(selector),
                    document: Some(document),
                    mutator: None,
                };
                resolve(operation, &context)
            }
        }
    }

    fn encrypt_payload(
        &self,
        config: &CollectionConfig,
        operation: Operation,
        context: CallContext<'_>,
        value: &Value,
        payload: Payload,
    ) -> Result<Value> {
        let transform = EncryptTransform::new(
            self.registry.as_ref(),
            &self.connection,
            config.options.client_options(),
        );
        Walker::new(
            self.registry.as_ref(),
            &self.connection,
            config,
            operation,
            context,
            &transform,
        )
        .walk(value, payload)
    }

    fn encrypt_mutator(
        &self,
        config: &CollectionConfig,
        context: CallContext<'_>,
        mutator: &Value,
    ) -> Result<Value> {
        let Value::Object(operations) = mutator else {
            return Ok(mutator.clone());
        };
        let mut out = serde_json::Map::new();
        for (op, fields) in operations {
            let walked = if TRANSFORMED_MUTATIONS.contains(&op.as_str()) {
                self.encrypt_payload(config, Operation::Update, context, fields, Payload::Mutator)?
            } else {
                fields.clone()
            };
            out.insert(op.clone(), walked);
        }
        Ok(Value::Object(out))
    }

    fn decrypt_document(
        &self,
        config: &CollectionConfig,
        selector: &Value,
        document: &Value,
    ) -> Result<Value> {
        let context = CallContext {
            selector: Some(selector),
            document: Some(document),
            mutator: None,
        };
        Walker::new(
            self.registry.as_ref(),
            &self.connection,
            config,
            Operation::Find,
            context,
            &DecryptTransform,
        )
        .walk(document, Payload::Document)
    }
}

impl<B> std::fmt::Debug for EncryptedCollection<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedCollection")
            .field("name", &self.name)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Fetched results awaiting per-document decryption.
///
/// With a dynamic configuration the resolver runs once per document
/// unless the cursor was opened with
/// [`fast_auto_encryption`](FindOptions::fast_auto_encryption).
pub struct Cursor<'c, B> {
    collection: &'c EncryptedCollection<B>,
    selector: Value,
    documents: Vec<Value>,
    config: Option<Arc<CollectionConfig>>,
    fast: bool,
}

impl<B: StorageBackend> Cursor<'_, B> {
    /// Number of matched documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether no documents matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Decrypts and returns every matched document.
    ///
    /// # Errors
    ///
    /// Propagates resolver and provider failures.
    pub fn fetch(self) -> Result<Vec<Value>> {
        self.documents.iter().map(|document| self.decrypt_one(document)).collect()
    }

    /// Invokes `f` with each decrypted document in turn.
    ///
    /// # Errors
    ///
    /// Propagates resolver and provider failures.
    pub fn for_each<F>(self, mut f: F) -> Result<()>
    where
        F: FnMut(Value),
    {
        for document in &self.documents {
            f(self.decrypt_one(document)?);
        }
        Ok(())
    }

    /// Maps each decrypted document through `f`.
    ///
    /// # Errors
    ///
    /// Propagates resolver and provider failures.
    pub fn map<T, F>(self, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(Value) -> T,
    {
        self.documents.iter().map(|document| self.decrypt_one(document).map(&mut f)).collect()
    }

    fn decrypt_one(&self, document: &Value) -> Result<Value> {
        let Some(call_config) = &self.config else {
            return Ok(document.clone());
        };
        let config = if self.fast {
            Some(Arc::clone(call_config))
        } else {
            self.collection.resolve_for_document(Operation::Find, &self.selector, document)?
        };
        match config {
            Some(config) => {
                self.collection.decrypt_document(&config, &self.selector, document)
            }
            None => Ok(document.clone()),
        }
    }
}
