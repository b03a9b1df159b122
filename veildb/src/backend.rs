//! Host storage seam.
//!
//! The engine does not implement storage. An [`EncryptedCollection`]
//! (see [`crate::collection`]) wraps any type implementing
//! [`StorageBackend`] and hands it fully-transformed payloads; the
//! backend never sees plaintext for schema-designated fields.

use crate::error::StorageError;
use serde_json::Value;

/// The underlying find/insert/update/remove primitives wrapped by the
/// operation facade.
///
/// Selectors handed to a backend are already encrypted; equality
/// matching against stored ciphertexts is exact-value comparison, which
/// is what makes deterministic encryption queryable.
pub trait StorageBackend: Send + Sync {
    /// Returns every document matching the selector.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] on backend failure.
    fn find(&self, selector: &Value) -> Result<Vec<Value>, StorageError>;

    /// Returns the first document matching the selector.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] on backend failure.
    fn find_one(&self, selector: &Value) -> Result<Option<Value>, StorageError>;

    /// Stores a document, returning its identifier.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] on backend failure.
    fn insert(&self, document: Value) -> Result<Value, StorageError>;

    /// Applies a mutator to every document matching the selector,
    /// returning the number of documents changed.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] on backend failure.
    fn update(&self, selector: &Value, mutator: &Value) -> Result<usize, StorageError>;

    /// Removes every document matching the selector, returning the
    /// number removed.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] on backend failure.
    fn remove(&self, selector: &Value) -> Result<usize, StorageError>;
}
