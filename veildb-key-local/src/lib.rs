//! Local software encryption provider for `VeilDB`.
//!
//! Keys never leave the process: a single master key (supplied in the
//! KMS configuration, inline or from a file) acts as the KEK, per-data-
//! key DEKs are derived from it with HKDF-SHA256, and the key vault is
//! an in-memory record store. Suitable for development, testing, and
//! single-node deployments; production setups plug in an external KMS
//! behind the same traits.
//!
//! Two cipher modes back the two algorithms:
//!
//! - `Random`: ChaCha20-Poly1305 with a fresh nonce per value
//! - `Deterministic`: AES-256-SIV, so equal plaintexts produce equal
//!   ciphertexts and equality selectors keep working
//!
//! Deterministic encryption of whole objects or arrays is rejected, as
//! their ciphertext equality would leak structural information without
//! ever being queryable.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod envelope;

use crate::envelope::Envelope;
use aes_siv::Aes256SivAead;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretVec};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;
use veildb::client::{
    ClientFactory, ClientOptions, DataKeyOptions, EncryptOptions, EncryptionClient, KeyRecord,
};
use veildb::config::Algorithm;
use veildb::error::ProviderError;
use zeroize::Zeroizing;

/// Name this provider answers to in KMS configurations.
pub const PROVIDER_NAME: &str = "local";

/// Required master key length in bytes.
pub const MASTER_KEY_LEN: usize = 96;

/// Derived DEK length: AES-256-SIV takes the full 64 bytes,
/// ChaCha20-Poly1305 the first 32.
const DEK_SIZE: usize = 64;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// Builds [`LocalClient`] instances from a KMS configuration of the
/// form `{"local": {"key": "<base64>"}}` or
/// `{"local": {"key_file": "<path>"}}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClientFactory;

impl LocalClientFactory {
    /// Creates the factory.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ClientFactory for LocalClientFactory {
    fn create(&self, options: &ClientOptions) -> Result<Arc<dyn EncryptionClient>, ProviderError> {
        let master_key = master_key_from_config(options.kms_providers.as_ref())?;
        Ok(Arc::new(LocalClient::new(master_key)))
    }
}

/// Software encryption client holding the master key and an in-memory
/// key vault.
pub struct LocalClient {
    master_key: SecretVec<u8>,
    vault: Mutex<Vec<KeyRecord>>,
}

impl LocalClient {
    /// Creates a client from a validated master key.
    #[must_use]
    pub fn new(master_key: SecretVec<u8>) -> Self {
        Self { master_key, vault: Mutex::new(Vec::new()) }
    }

    /// Creates a client from raw master key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when the key is not [`MASTER_KEY_LEN`] bytes.
    pub fn with_master_key(bytes: Vec<u8>) -> Result<Self, ProviderError> {
        if bytes.len() != MASTER_KEY_LEN {
            return Err(ProviderError::CreationFailed(format!(
                "master key must be {MASTER_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self::new(SecretVec::new(bytes)))
    }

    fn record_for_alias(&self, alias: &str) -> Result<KeyRecord, ProviderError> {
        self.vault
            .lock()
            .iter()
            .find(|record| record.key_alt_names.iter().any(|name| name == alias))
            .cloned()
            .ok_or_else(|| ProviderError::KeyNotFound(alias.to_string()))
    }

    /// Derives the DEK for a data key from the master key; the key id
    /// is the HKDF info, so every data key gets an independent DEK.
    fn derive_dek(&self, key_id: &str) -> Result<Zeroizing<Vec<u8>>, ProviderError> {
        let hkdf = Hkdf::<Sha256>::new(None, self.master_key.expose_secret());
        let mut dek = Zeroizing::new(vec![0u8; DEK_SIZE]);
        hkdf.expand(key_id.as_bytes(), &mut dek)
            .map_err(|_| ProviderError::EncryptionFailed("DEK derivation failed".to_string()))?;
        Ok(dek)
    }
}

impl EncryptionClient for LocalClient {
    fn encrypt(
        &self,
        plaintext: &[u8],
        options: &EncryptOptions,
    ) -> Result<Vec<u8>, ProviderError> {
        let record = self.record_for_alias(&options.key_alt_name)?;
        let dek = self.derive_dek(&record.id)?;

        let (body, nonce) = match options.algorithm {
            Algorithm::Random => {
                let cipher = ChaCha20Poly1305::new_from_slice(&dek[..32]).map_err(|e| {
                    ProviderError::EncryptionFailed(format!("invalid DEK: {e}"))
                })?;

                let mut nonce_bytes = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from(nonce_bytes);

                // The key id authenticates as associated data, binding
                // the ciphertext to its envelope header.
                let body = cipher
                    .encrypt(&nonce, Payload { msg: plaintext, aad: record.id.as_bytes() })
                    .map_err(|e| {
                        ProviderError::EncryptionFailed(format!(
                            "ChaCha20-Poly1305 encryption failed: {e}"
                        ))
                    })?;
                (body, nonce_bytes.to_vec())
            }
            Algorithm::Deterministic => {
                reject_container(plaintext)?;

                let cipher = Aes256SivAead::new_from_slice(&dek[..]).map_err(|e| {
                    ProviderError::EncryptionFailed(format!("invalid DEK: {e}"))
                })?;

                // AES-SIV is deterministic with an empty nonce.
                let body = cipher
                    .encrypt(
                        &Default::default(),
                        Payload { msg: plaintext, aad: record.id.as_bytes() },
                    )
                    .map_err(|e| {
                        ProviderError::EncryptionFailed(format!(
                            "AES-SIV encryption failed: {e}"
                        ))
                    })?;
                (body, Vec::new())
            }
        };

        let envelope = Envelope::new(&record.id, options.algorithm, nonce);
        let mut out = envelope.to_bytes()?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let (envelope, consumed) = Envelope::from_bytes(ciphertext)?;
        let body = &ciphertext[consumed..];
        let dek = self.derive_dek(envelope.key_id())?;
        let aad = envelope.key_id().as_bytes();

        match envelope.algorithm() {
            Algorithm::Random => {
                let cipher = ChaCha20Poly1305::new_from_slice(&dek[..32]).map_err(|e| {
                    ProviderError::DecryptionFailed(format!("invalid DEK: {e}"))
                })?;
                let nonce_bytes: [u8; NONCE_SIZE] = envelope.nonce().try_into().map_err(|_| {
                    ProviderError::DecryptionFailed("invalid nonce size".to_string())
                })?;
                let nonce = Nonce::from(nonce_bytes);
                cipher.decrypt(&nonce, Payload { msg: body, aad }).map_err(|_| {
                    ProviderError::DecryptionFailed(
                        "authentication failed: ciphertext may be corrupted".to_string(),
                    )
                })
            }
            Algorithm::Deterministic => {
                let cipher = Aes256SivAead::new_from_slice(&dek[..]).map_err(|e| {
                    ProviderError::DecryptionFailed(format!("invalid DEK: {e}"))
                })?;
                cipher.decrypt(&Default::default(), Payload { msg: body, aad }).map_err(|_| {
                    ProviderError::DecryptionFailed(
                        "authentication failed: ciphertext may be corrupted".to_string(),
                    )
                })
            }
        }
    }

    fn create_data_key(
        &self,
        provider: &str,
        options: &DataKeyOptions,
    ) -> Result<String, ProviderError> {
        if provider != PROVIDER_NAME {
            return Err(ProviderError::CreationFailed(format!(
                "unsupported KMS provider: {provider}"
            )));
        }
        let record = KeyRecord {
            id: Uuid::new_v4().to_string(),
            key_alt_names: options.key_alt_names.clone(),
            master_key: options.master_key.clone(),
        };
        let id = record.id.clone();
        self.vault.lock().push(record);
        Ok(id)
    }

    fn vault_keys(&self) -> Result<Vec<KeyRecord>, ProviderError> {
        Ok(self.vault.lock().clone())
    }
}

impl std::fmt::Debug for LocalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClient")
            .field("vault_keys", &self.vault.lock().len())
            .finish_non_exhaustive()
    }
}

/// Builds the KMS configuration value for a raw master key, for use in
/// an [`EncryptionConfig`](veildb::config::EncryptionConfig).
#[must_use]
pub fn master_key_config(master_key: &[u8]) -> Value {
    serde_json::json!({
        PROVIDER_NAME: {
            "key": base64::engine::general_purpose::STANDARD.encode(master_key),
        }
    })
}

fn master_key_from_config(kms_providers: Option<&Value>) -> Result<SecretVec<u8>, ProviderError> {
    let local = kms_providers
        .and_then(|providers| providers.get(PROVIDER_NAME))
        .ok_or_else(|| {
            ProviderError::CreationFailed("no local KMS provider configured".to_string())
        })?;

    let encoded = if let Some(key) = local.get("key").and_then(Value::as_str) {
        key.to_string()
    } else if let Some(path) = local.get("key_file").and_then(Value::as_str) {
        std::fs::read_to_string(path)
            .map_err(|e| {
                ProviderError::CreationFailed(format!("cannot read key file {path}: {e}"))
            })?
            .trim()
            .to_string()
    } else {
        return Err(ProviderError::CreationFailed(
            "local KMS provider needs a `key` or `key_file`".to_string(),
        ));
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| ProviderError::CreationFailed(format!("master key is not base64: {e}")))?;
    if bytes.len() != MASTER_KEY_LEN {
        return Err(ProviderError::CreationFailed(format!(
            "master key must be {MASTER_KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(SecretVec::new(bytes))
}

/// Deterministic mode only covers scalar values: equal container
/// ciphertexts would leak structure without being queryable.
fn reject_container(plaintext: &[u8]) -> Result<(), ProviderError> {
    let first = plaintext.iter().copied().find(|byte| !byte.is_ascii_whitespace());
    if matches!(first, Some(b'{' | b'[')) {
        return Err(ProviderError::InvalidAlgorithm(
            "deterministic encryption cannot cover objects or arrays".to_string(),
        ));
    }
    Ok(())
}
