//! Checkpoint storage trait

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

/// Trait for checkpoint storage operations.
///
/// Keys are query identifiers, values are the cursor values rendered as the
/// strings the database returned for them. The store does not interpret
/// values; ordering is guaranteed by the caller, which only ever advances a
/// query to the last cursor of a batch fetched with `cursor > checkpoint`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the checkpoint for a query.
    ///
    /// Returns None if the query has never been advanced.
    async fn load(&self, query_id: &str) -> Result<Option<String>>;

    /// Record that every row up to and including `value` was delivered.
    async fn advance(&self, query_id: &str, value: String) -> Result<()>;

    /// Copy of every checkpoint currently held.
    async fn snapshot(&self) -> Result<BTreeMap<String, String>>;
}
