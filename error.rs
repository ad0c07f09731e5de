use thiserror::Error;

/// Errors surfaced by an upload call.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Passphrase encryption requested but no passphrase is configured
    #[error("no passphrase configured for {operation}")]
    PassphraseNotFound { operation: String },

    /// The encryption layer could not be constructed
    #[error("Encryption error: {0}")]
    Encryption(#[from] CryptoError),

    /// Source read or conduit write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage backend rejected or failed the upload after the producer
    /// finished; `written` is the transformed byte count the producer pushed
    #[error("Store error after {written} bytes: {source}")]
    Store {
        written: u64,
        #[source]
        source: StoreError,
    },

    /// One of the upload phases exited without reporting
    #[error("Upload task failed: {0}")]
    Task(String),
}

impl UploadError {
    pub fn passphrase_not_found(operation: impl Into<String>) -> Self {
        Self::PassphraseNotFound {
            operation: operation.into(),
        }
    }

    pub fn store(written: u64, source: StoreError) -> Self {
        Self::Store { written, source }
    }

    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }
}

/// Errors raised while setting up encryption for an object.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no recipients to encrypt to")]
    NoRecipients,

    #[error("too many recipients: {0} (at most 255)")]
    TooManyRecipients(usize),

    #[error("passphrase is empty")]
    EmptyPassphrase,

    #[error("expected 32-byte key but found {0} bytes")]
    KeyLength(usize),

    #[error("scrypt work factor {0} is out of range")]
    WorkFactor(u8),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("cipher failure: {0}")]
    Cipher(String),
}

/// Errors returned by an [`ObjectStore`](crate::store::ObjectStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    /// The object body yielded an error while it was being stored
    #[error("Body stream failed: {source}")]
    Body {
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn body(source: std::io::Error) -> Self {
        Self::Body { source }
    }
}
