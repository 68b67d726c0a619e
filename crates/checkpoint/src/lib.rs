//! Checkpoint management for mysql-records
//!
//! Tracks, per configured query, the last cursor value that was successfully
//! delivered downstream.
//!
//! # Architecture
//!
//! - [`CheckpointStore`] is the storage-agnostic interface used by the
//!   delivery controller (writes) and the query executor (reads)
//! - [`MemoryStore`] keeps checkpoints for the lifetime of the receiver
//! - [`FilesystemStore`] persists checkpoints as a single JSON document
//!   ([`CheckpointFile`]) so that a restart resumes where it left off
//!
//! Snapshot queries (no cursor column) never have an entry.

mod config;
mod file;
mod filesystem;
mod memory;
pub mod store;


pub use config::CheckpointStorage;
pub use file::CheckpointFile;
pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use store::CheckpointStore;

use std::sync::Arc;

/// Open the checkpoint store described by `storage`.
///
/// The filesystem backend reads any previously persisted checkpoints while
/// opening, so the returned store is ready to serve `load` calls.
pub fn open_store(storage: &CheckpointStorage) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    match storage {
        CheckpointStorage::Memory => Ok(Arc::new(MemoryStore::new())),
        CheckpointStorage::Filesystem { dir } => Ok(Arc::new(FilesystemStore::open(dir)?)),
    }
}
