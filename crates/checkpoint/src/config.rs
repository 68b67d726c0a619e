//! Checkpoint storage configuration.

use serde::{Deserialize, Serialize};

/// Where checkpoints live.
///
/// ```toml
/// checkpoint_storage = { kind = "filesystem", dir = "/var/lib/mysql-records" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointStorage {
    /// Keep checkpoints in memory only; rows are re-delivered after a restart.
    #[default]
    Memory,

    /// Persist checkpoints to `<dir>/checkpoints.json`.
    Filesystem { dir: String },
}
