//! Error types for `VeilDB` operations.

/// Convenience result alias for `VeilDB` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for `VeilDB` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two configured schema paths stand in a prefix relationship.
    ///
    /// Raised at schema construction time and never recovered: the
    /// configuration itself is contradictory.
    #[error("conflicting schema paths: `{shorter}` is a prefix of `{longer}`")]
    SchemaConflict {
        /// The shorter of the two conflicting paths.
        shorter: String,
        /// The longer path that the shorter one prefixes.
        longer: String,
    },

    /// The same schema path was configured twice.
    #[error("schema path configured twice: `{0}`")]
    DuplicatePath(String),

    /// A schema path is empty or contains an empty segment.
    #[error("invalid schema path: `{0}`")]
    InvalidPath(String),

    /// A dynamic resolver failed.
    ///
    /// Propagated to the caller of the triggering operation, never
    /// swallowed.
    #[error("resolver failed: {0}")]
    Resolution(String),

    /// The encryption provider rejected an operation.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The underlying storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON (de)serialization of a field value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Builds a resolution error from any displayable cause.
    ///
    /// Intended for dynamic resolver implementations.
    pub fn resolution(cause: impl std::fmt::Display) -> Self {
        Self::Resolution(cause.to_string())
    }
}

/// Errors surfaced by an encryption provider (client or factory).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No data key is registered under the requested alias.
    #[error("data key not found for alias: {0}")]
    KeyNotFound(String),

    /// Client or data-key creation failed.
    #[error("key creation failed: {0}")]
    CreationFailed(String),

    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The requested algorithm cannot encrypt the value's shape.
    #[error("unsupported algorithm for value: {0}")]
    InvalidAlgorithm(String),

    /// A decrypt transform met a value that is not in encrypted form.
    ///
    /// Suppressed when the configuration sets `safe: true`.
    #[error("value is not in encrypted form")]
    NotEncrypted,

    /// The key vault could not be read.
    #[error("key vault unavailable: {0}")]
    VaultUnavailable(String),
}

/// Errors surfaced by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A selector or mutator was structurally unusable.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// The backend itself failed.
    #[error("backend failure: {0}")]
    Backend(String),
}
