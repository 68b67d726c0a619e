//! Filesystem-based checkpoint storage implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::file::CheckpointFile;
use crate::store::CheckpointStore;

const CHECKPOINT_FILE_NAME: &str = "checkpoints.json";

/// Filesystem implementation of CheckpointStore trait.
///
/// All checkpoints live in one JSON file. Every `advance` rewrites the file
/// through a temporary sibling and a rename, so readers never observe a
/// partially written document.
pub struct FilesystemStore {
    dir: PathBuf,
    cursors: RwLock<BTreeMap<String, String>>,
}

impl FilesystemStore {
    /// Open the store in `dir`, creating the directory if needed and loading
    /// any checkpoints persisted by a previous run.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;

        let path = dir.join(CHECKPOINT_FILE_NAME);
        let cursors = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file = CheckpointFile::parse(&content)
                .with_context(|| format!("Invalid checkpoint file {}", path.display()))?;
            tracing::info!(
                "Loaded {} checkpoints from {} (written {})",
                file.cursors.len(),
                path.display(),
                file.updated_at()
            );
            file.cursors
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            dir,
            cursors: RwLock::new(cursors),
        })
    }

    /// Get the directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist(&self, cursors: &BTreeMap<String, String>) -> Result<()> {
        let file = CheckpointFile::new(cursors.clone());
        let path = self.dir.join(CHECKPOINT_FILE_NAME);
        let tmp = self.dir.join(format!("{CHECKPOINT_FILE_NAME}.tmp"));

        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FilesystemStore {
    async fn load(&self, query_id: &str) -> Result<Option<String>> {
        Ok(self.cursors.read().await.get(query_id).cloned())
    }

    /// The in-memory value is advanced even when writing the file fails; the
    /// error is still returned so the caller can report that the checkpoint
    /// will not survive a restart.
    async fn advance(&self, query_id: &str, value: String) -> Result<()> {
        let mut cursors = self.cursors.write().await;
        cursors.insert(query_id.to_string(), value);
        self.persist(&cursors)?;
        tracing::debug!(query_id, "Stored checkpoint to {}", self.dir.display());
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.cursors.read().await.clone())
    }
}
