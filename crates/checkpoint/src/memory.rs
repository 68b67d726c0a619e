//! In-memory checkpoint storage.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::CheckpointStore;

/// Checkpoints held in memory for the lifetime of the receiver.
///
/// A restart begins again from each query's initial cursor value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    cursors: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self, query_id: &str) -> Result<Option<String>> {
        Ok(self.cursors.read().await.get(query_id).cloned())
    }

    async fn advance(&self, query_id: &str, value: String) -> Result<()> {
        tracing::debug!(query_id, checkpoint = %value, "Advancing checkpoint");
        self.cursors
            .write()
            .await
            .insert(query_id.to_string(), value);
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.cursors.read().await.clone())
    }
}
