//! # `VeilDB`
//!
//! Schema-driven field-level encryption overlay for JSON document
//! collections and the selector/mutator expressions that query them.
//!
//! ## Features
//!
//! - Path schema with nested fields, array-element markers (`$`) and
//!   wildcards (`*`), conflict-checked at construction
//! - Structural walker that transforms documents, selectors, and
//!   mutators through a fixed MongoDB-style operator vocabulary
//! - Cached encryption clients and lazily created data keys, one per
//!   key-vault/KMS configuration and key alias
//! - Static, per-field-resolver, or fully dynamic per-call
//!   configuration, with a fast path for selector-invariant resolvers
//! - Pluggable storage backends and encryption providers
//!
//! ## Example
//!
//! ```rust,ignore
//! use veildb::prelude::*;
//! use serde_json::json;
//!
//! let registry = Arc::new(ProviderRegistry::new(factory));
//! let users = EncryptedCollection::new("users", backend, registry);
//!
//! let schema = FieldSchema::build([
//!     ("ssn", FieldSpec::Enabled),
//!     ("history.$", FieldSpec::Enabled),
//! ])?;
//! users.configure_encryption(ConfigSource::fixed(CollectionConfig::new(
//!     EncryptionConfig::default(),
//!     schema,
//! )));
//!
//! users.insert(&json!({"ssn": "123-45-6789", "history": [1, 2]}))?;
//! let found = users.find_one(&json!({"ssn": "123-45-6789"}))?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod client;
pub mod collection;
pub mod config;
pub mod error;
pub mod memory;
pub mod operators;
pub mod registry;
pub mod schema;
pub mod walker;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::backend::StorageBackend;
    pub use crate::client::{ClientFactory, ClientOptions, EncryptionClient};
    pub use crate::collection::{Cursor, EncryptedCollection, FindOptions};
    pub use crate::config::{
        Algorithm, CallContext, CollectionConfig, ConfigSource, EncryptionConfig, FieldOptions,
        Operation,
    };
    pub use crate::error::{Error, ProviderError, Result, StorageError};
    pub use crate::memory::MemoryBackend;
    pub use crate::registry::ProviderRegistry;
    pub use crate::schema::{FieldSchema, FieldSpec};
}
