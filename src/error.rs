//! Error types for keyfleet.
//!
//! Every variant is a distinct failure mode in the credential store.
//! Messages stay minimal — they say *what* failed without echoing key
//! material or decrypted content back to the caller.

use thiserror::Error;

/// The single error type for all keyfleet operations.
#[derive(Debug, Error)]
pub enum KmsError {
    /// An envelope key was invalid (wrong length, malformed, etc.).
    #[error("invalid key")]
    InvalidKey,

    /// Encryption failed. The underlying `ring` operation returned an error.
    #[error("encryption failed")]
    EncryptionFailure,

    /// Decryption failed. This includes: wrong key, tampered ciphertext,
    /// or corrupted GCM authentication tag.
    #[error("decryption failed")]
    DecryptionFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// An entry's `key_id` does not match the envelope key asked to open it.
    #[error("key id mismatch: entry sealed under {found}, store holds {expected}")]
    KeyMismatch { expected: String, found: String },

    /// The named entry or secret does not exist in the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// An aggregate secret or stored record could not be decoded.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A private key could not be parsed or re-encoded.
    #[error("unsupported or malformed private key: {0}")]
    UnsupportedKey(String),

    /// A backend provider call failed.
    #[error("store operation failed: {0}")]
    StoreOperation(String),

    /// The provider refused to schedule another version deletion.
    /// Advisory — version cleanup retries on the next write.
    #[error("version cleanup limit reached")]
    VersionCleanupLimit,

    /// Required configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A remote host command returned a non-zero exit status.
    #[error("remote command failed on {host}: exit {status}")]
    RemoteCommand { host: String, status: i32 },

    /// OpenSSH (de)serialisation failed.
    #[error(transparent)]
    SshKey(#[from] ssh_key::Error),

    /// JSON (de)serialisation failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, KmsError>;
