//! Encryption provider seam: the client and factory traits, key vault
//! records, and the ciphertext marker representation.
//!
//! The engine never performs cryptography itself. It obtains an
//! [`EncryptionClient`] from a [`ClientFactory`] (one per key-vault/KMS
//! configuration) and hands it plaintext bytes; ciphers, key wrapping,
//! and vault persistence are the provider's job.

use crate::config::Algorithm;
use crate::error::ProviderError;
use base64::Engine as _;
use serde_json::Value;
use std::sync::Arc;

/// Options for a single encrypt call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptOptions {
    /// Alias of the data key to encrypt under.
    pub key_alt_name: String,
    /// Algorithm to use.
    pub algorithm: Algorithm,
}

/// Options for creating a data key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataKeyOptions {
    /// Master key descriptor for the KMS provider.
    pub master_key: Option<Value>,
    /// Aliases the new key is registered under.
    pub key_alt_names: Vec<String>,
}

/// One key vault record.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    /// Provider-assigned data-key identifier.
    pub id: String,
    /// Aliases this key answers to.
    pub key_alt_names: Vec<String>,
    /// Master key material/descriptor used to create it.
    pub master_key: Option<Value>,
}

/// Handle to an external encryption provider, scoped to one
/// key-vault/KMS configuration.
///
/// Implementations must be thread-safe (`Send + Sync`); the cache hands
/// one shared instance to concurrent operations.
pub trait EncryptionClient: Send + Sync {
    /// Encrypts plaintext bytes under the named data key.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when the key is unknown or the
    /// algorithm cannot encrypt the value's shape.
    fn encrypt(&self, plaintext: &[u8], options: &EncryptOptions)
        -> Result<Vec<u8>, ProviderError>;

    /// Decrypts ciphertext bytes produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] on malformed or tampered input.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Creates a data key and registers it in the vault under the given
    /// aliases, returning its identifier.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when the provider rejects creation.
    fn create_data_key(
        &self,
        provider: &str,
        options: &DataKeyOptions,
    ) -> Result<String, ProviderError>;

    /// Reads every record currently in the key vault.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when the vault is unreachable.
    fn vault_keys(&self) -> Result<Vec<KeyRecord>, ProviderError>;
}

/// Client-construction options: the key-vault/KMS configuration one
/// client instance is scoped to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientOptions {
    /// Namespace of the key vault collection.
    pub key_vault_namespace: Option<String>,
    /// KMS provider configurations, keyed by provider name.
    pub kms_providers: Option<Value>,
}

/// Produces [`EncryptionClient`] instances for the cache.
pub trait ClientFactory: Send + Sync {
    /// Creates a client for the given configuration.
    ///
    /// Called at most once per canonicalized configuration per
    /// connection; the result is cached for the connection's lifetime.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when the configuration is unusable.
    fn create(&self, options: &ClientOptions) -> Result<Arc<dyn EncryptionClient>, ProviderError>;
}

/// Object key marking an encrypted leaf inside a document.
pub const CIPHER_KEY: &str = "$cipher";

/// Wraps ciphertext bytes into the in-document marker form
/// `{"$cipher": "<base64>"}`.
#[must_use]
pub fn encode_ciphertext(bytes: &[u8]) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(
        CIPHER_KEY.to_string(),
        Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    );
    Value::Object(map)
}

/// Extracts ciphertext bytes from a marker value, or `None` when the
/// value is not in encrypted form.
#[must_use]
pub fn decode_ciphertext(value: &Value) -> Option<Vec<u8>> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let encoded = map.get(CIPHER_KEY)?.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

/// Whether a value is in the encrypted marker form.
#[must_use]
pub fn is_ciphertext(value: &Value) -> bool {
    decode_ciphertext(value).is_some()
}
