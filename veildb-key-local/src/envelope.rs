//! Ciphertext envelope format.
//!
//! Every ciphertext starts with a compact header naming the data key
//! and algorithm needed to decrypt it:
//!
//! ```text
//! [version:1][key_id_len:1][key_id:N][flags:1][nonce_len:1][nonce:L]
//! ```
//!
//! followed by the AEAD output.

use veildb::config::Algorithm;
use veildb::error::ProviderError;

/// Protocol version for the envelope format.
pub const PROTOCOL_VERSION: u8 = 1;

const FLAG_DETERMINISTIC: u8 = 0x01;

/// Parsed envelope header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    version: u8,
    key_id: String,
    algorithm: Algorithm,
    nonce: Vec<u8>,
}

impl Envelope {
    /// Creates an envelope for fresh ciphertext.
    #[must_use]
    pub fn new(key_id: impl Into<String>, algorithm: Algorithm, nonce: Vec<u8>) -> Self {
        Self { version: PROTOCOL_VERSION, key_id: key_id.into(), algorithm, nonce }
    }

    /// The identifier of the data key this ciphertext was produced with.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The algorithm the payload was encrypted with.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The AEAD nonce (empty in deterministic mode).
    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Serializes the header.
    ///
    /// # Errors
    ///
    /// Returns an error when the key id exceeds 255 bytes or the nonce
    /// exceeds 255 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProviderError> {
        if self.key_id.len() > 255 {
            return Err(ProviderError::EncryptionFailed(format!(
                "key id too long: {} bytes (max: 255)",
                self.key_id.len()
            )));
        }
        if self.nonce.len() > 255 {
            return Err(ProviderError::EncryptionFailed(format!(
                "nonce too long: {} bytes (max: 255)",
                self.nonce.len()
            )));
        }

        let mut bytes = Vec::with_capacity(4 + self.key_id.len() + self.nonce.len());
        bytes.push(self.version);
        // Safe cast: lengths validated above.
        #[allow(clippy::cast_possible_truncation)]
        bytes.push(self.key_id.len() as u8);
        bytes.extend_from_slice(self.key_id.as_bytes());
        let flags = match self.algorithm {
            Algorithm::Deterministic => FLAG_DETERMINISTIC,
            Algorithm::Random => 0,
        };
        bytes.push(flags);
        #[allow(clippy::cast_possible_truncation)]
        bytes.push(self.nonce.len() as u8);
        bytes.extend_from_slice(&self.nonce);
        Ok(bytes)
    }

    /// Parses a header from the front of a ciphertext, returning the
    /// envelope and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data or an unsupported version.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), ProviderError> {
        let malformed = |what: &str| ProviderError::DecryptionFailed(what.to_string());

        if data.is_empty() {
            return Err(malformed("empty ciphertext"));
        }

        let mut pos = 0;
        let version = data[pos];
        pos += 1;
        if version != PROTOCOL_VERSION {
            return Err(ProviderError::DecryptionFailed(format!(
                "unsupported envelope version: {version}"
            )));
        }

        let key_id_len = *data.get(pos).ok_or_else(|| malformed("missing key id length"))? as usize;
        pos += 1;
        if pos + key_id_len > data.len() {
            return Err(malformed("key id truncated"));
        }
        let key_id = String::from_utf8(data[pos..pos + key_id_len].to_vec())
            .map_err(|_| malformed("key id is not UTF-8"))?;
        pos += key_id_len;

        let flags = *data.get(pos).ok_or_else(|| malformed("missing flags"))?;
        pos += 1;
        let algorithm = if flags & FLAG_DETERMINISTIC != 0 {
            Algorithm::Deterministic
        } else {
            Algorithm::Random
        };

        let nonce_len = *data.get(pos).ok_or_else(|| malformed("missing nonce length"))? as usize;
        pos += 1;
        if pos + nonce_len > data.len() {
            return Err(malformed("nonce truncated"));
        }
        let nonce = data[pos..pos + nonce_len].to_vec();
        pos += nonce_len;

        Ok((Self { version, key_id, algorithm, nonce }, pos))
    }
}
