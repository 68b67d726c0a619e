//! On-disk checkpoint document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current format version written by [`CheckpointFile::new`].
pub const CHECKPOINT_FILE_VERSION: u32 = 1;

/// Storage-agnostic checkpoint document.
///
/// # File Format
///
/// ```json
/// {
///     "version": 1,
///     "updated_at": "2024-01-01T00:00:00Z",
///     "cursors": {
///         "Q2": "7",
///         "audit": "2024-01-01 09:30:00"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Format version
    pub version: u32,
    /// When this document was written
    pub updated_at: DateTime<Utc>,
    /// Last delivered cursor value per query identifier
    pub cursors: BTreeMap<String, String>,
}

impl CheckpointFile {
    /// Create a document for the given cursors, stamped with the current time.
    pub fn new(cursors: BTreeMap<String, String>) -> Self {
        Self {
            version: CHECKPOINT_FILE_VERSION,
            updated_at: Utc::now(),
            cursors,
        }
    }

    /// Parse a document, rejecting versions this build does not understand.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let file: CheckpointFile = serde_json::from_str(content)?;
        if file.version != CHECKPOINT_FILE_VERSION {
            anyhow::bail!(
                "Unsupported checkpoint file version: expected {}, found {}",
                CHECKPOINT_FILE_VERSION,
                file.version
            );
        }
        Ok(file)
    }

    /// Get the timestamp when this document was written.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
