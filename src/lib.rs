//! mysql-records
//!
//! Polls a MySQL database on an interval, turns each new row into a JSON
//! record, and hands records to a downstream consumer with at-least-once
//! delivery.
//!
//! - Snapshot queries (no cursor column) are re-run in full every tick
//! - Incremental queries resume after the last delivered cursor value,
//!   tracked per query in a [`checkpoint::CheckpointStore`]
//! - Checkpoints advance only after the consumer accepted the batch
//!
//! # CLI Usage
//!
//! ```bash
//! # Validate a configuration and print the first-run SQL of every query
//! mysql-records validate --config receiver.toml
//!
//! # Poll and write records to stdout as JSON lines
//! RUST_LOG=info mysql-records run --config receiver.toml
//!
//! # Produce ciphertext for password_type = "encrypted"
//! mysql-records encrypt-password --secret-path /etc/mysql-records/secret
//! ```

pub mod config;
pub mod delivery;
pub mod receiver;
pub mod scheduler;
pub mod sink;

pub use config::{ConfigError, ReceiverConfig};
pub use delivery::{DeliveryController, DeliveryError, DeliveryOutcome, RecordConsumer, RetryPolicy};
pub use receiver::{Receiver, ReceiverSettings, ShutdownStatus};
pub use scheduler::{CycleReport, PollOutcome, Scheduler};
pub use sink::JsonLinesConsumer;
