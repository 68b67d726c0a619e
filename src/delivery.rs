//! Delivery and retry controller
//!
//! Hands a batch to the downstream [`RecordConsumer`] and advances the
//! query's checkpoint only after the consumer accepted it. Transient
//! rejections are retried after a fixed delay; permanent ones drop the batch
//! at once. A dropped batch leaves the checkpoint where it was, so the same
//! rows are fetched again on the next tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use checkpoint::CheckpointStore;
use mysql_records_source::Batch;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Downstream rejection, classified by the consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Backpressure or a temporary outage; the same batch may succeed later
    #[error("transient delivery error: {0}")]
    Transient(String),

    #[error("permanent delivery error: {0}")]
    Permanent(String),
}

/// Downstream consumer of record batches.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    async fn consume(&self, batch: &Batch) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between a transient failure and the next attempt
    pub delay: Duration,
    /// Retries after the first attempt; 0 means a single attempt
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The consumer accepted the batch; `checkpoint` is the value stored, if
    /// the query tracks one
    Delivered {
        attempts: u32,
        checkpoint: Option<String>,
    },
    Dropped {
        attempts: u32,
        reason: String,
    },
    /// Shutdown arrived while waiting to retry
    Cancelled { attempts: u32 },
    /// Nothing to send
    Empty,
}

pub struct DeliveryController {
    consumer: Arc<dyn RecordConsumer>,
    store: Arc<dyn CheckpointStore>,
    policy: RetryPolicy,
}

impl DeliveryController {
    pub fn new(
        consumer: Arc<dyn RecordConsumer>,
        store: Arc<dyn CheckpointStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            consumer,
            store,
            policy,
        }
    }

    /// Deliver `batch`, retrying transient failures.
    ///
    /// Only checkpoint store failures are returned as errors; consumer
    /// rejections are reported through the outcome.
    pub async fn deliver(
        &self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DeliveryOutcome> {
        if batch.is_empty() {
            return Ok(DeliveryOutcome::Empty);
        }

        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.consumer.consume(batch).await {
                Ok(()) => {
                    if let Some(value) = &batch.next_checkpoint {
                        self.store
                            .advance(&batch.query_id, value.clone())
                            .await
                            .with_context(|| {
                                format!("Failed to advance checkpoint for '{}'", batch.query_id)
                            })?;
                    }
                    debug!(
                        query_id = %batch.query_id,
                        records = batch.len(),
                        attempts = attempt,
                        "Delivered batch"
                    );
                    return Ok(DeliveryOutcome::Delivered {
                        attempts: attempt,
                        checkpoint: batch.next_checkpoint.clone(),
                    });
                }
                Err(DeliveryError::Permanent(reason)) => {
                    warn!(
                        query_id = %batch.query_id,
                        records = batch.len(),
                        "Dropping batch after permanent delivery error: {reason}"
                    );
                    return Ok(DeliveryOutcome::Dropped {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(DeliveryError::Transient(reason)) if attempt >= max_attempts => {
                    warn!(
                        query_id = %batch.query_id,
                        records = batch.len(),
                        "Dropping batch after {attempt} attempts: {reason}"
                    );
                    return Ok(DeliveryOutcome::Dropped {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(DeliveryError::Transient(reason)) => {
                    warn!(
                        query_id = %batch.query_id,
                        "Delivery attempt {attempt}/{max_attempts} failed: {reason}. Retrying in {:?}...",
                        self.policy.delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(query_id = %batch.query_id, "Retry interrupted by shutdown");
                            return Ok(DeliveryOutcome::Cancelled { attempts: attempt });
                        }
                        _ = tokio::time::sleep(self.policy.delay) => {}
                    }
                }
            }
        }
    }
}
