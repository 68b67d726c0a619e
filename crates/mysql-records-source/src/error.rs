//! Error types for the MySQL record source.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving credentials, talking to MySQL, or turning
/// rows into records.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or contradictory configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The encryption key file could not be read or has the wrong shape.
    #[error("Secret file '{}' is unavailable: {reason}", path.display())]
    SecretUnavailable { path: PathBuf, reason: String },

    /// Ciphertext could not be authenticated with the configured key.
    #[error("Password decryption failed: {0}")]
    DecryptionFailed(String),

    /// Plaintext could not be sealed.
    #[error("Password encryption failed: {0}")]
    EncryptionFailed(String),

    /// The cloud credential service did not produce a token.
    #[error("IAM authentication token issuance failed: {0}")]
    TokenIssuanceFailed(String),

    /// The certificate bundle for IAM authentication is unusable.
    #[error("Trust store '{}' is invalid: {reason}", path.display())]
    TrustStoreInvalid { path: PathBuf, reason: String },

    /// A pooled connection could not be opened.
    #[error("MySQL connection error: {0}")]
    Connection(#[source] mysql_async::Error),

    /// Query execution, column introspection, or row scan failed.
    #[error("Query '{query_id}' failed: {source}")]
    Query {
        query_id: String,
        #[source]
        source: mysql_async::Error,
    },

    /// The query ran but its result set cannot be processed.
    #[error("Query '{query_id}' returned an unusable result set: {reason}")]
    ResultSet { query_id: String, reason: String },

    /// A row could not be serialized into a record.
    #[error("Failed to encode record for query '{query_id}': {source}")]
    Encoding {
        query_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// True for failures that are expected to clear up by themselves on a
    /// later tick (the database being unreachable).
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
