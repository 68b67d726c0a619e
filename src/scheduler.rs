//! Polling scheduler
//!
//! Every tick runs one cycle over all configured queries, at most
//! `max_workers` at a time. A cycle completes before the next tick is
//! taken, so a query is never polled by two workers at once and its
//! checkpoint has a single writer.

use std::sync::Arc;
use std::time::Duration;

use checkpoint::CheckpointStore;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use mysql_records_source::{QueryExecutor, QuerySpec};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryController, DeliveryOutcome};

/// Result of polling one query in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed {
        records: usize,
        delivery: DeliveryOutcome,
    },
    /// Fetch or checkpoint failure; the query is retried next tick
    Failed(String),
    /// Shutdown started before the query was polled
    Skipped,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(String, PollOutcome)>,
}

impl CycleReport {
    pub fn outcome(&self, query_id: &str) -> Option<&PollOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == query_id)
            .map(|(_, outcome)| outcome)
    }

    /// Records accepted downstream in this cycle.
    pub fn delivered_records(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, outcome)| match outcome {
                PollOutcome::Completed {
                    records,
                    delivery: DeliveryOutcome::Delivered { .. },
                } => *records,
                _ => 0,
            })
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, PollOutcome::Failed(_)))
            .count()
    }
}

pub struct Scheduler {
    queries: Vec<QuerySpec>,
    executor: QueryExecutor,
    store: Arc<dyn CheckpointStore>,
    delivery: DeliveryController,
    interval: Duration,
    max_workers: usize,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        queries: Vec<QuerySpec>,
        executor: QueryExecutor,
        store: Arc<dyn CheckpointStore>,
        delivery: DeliveryController,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queries,
            executor,
            store,
            delivery,
            interval: crate::config::DEFAULT_COLLECTION_INTERVAL,
            max_workers: crate::config::DEFAULT_MAX_DB_WORKERS,
            cancel,
        }
    }

    /// Zero keeps the current interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.interval = interval;
        }
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Tick until cancelled. The first cycle runs immediately.
    pub async fn run(self) {
        info!(
            queries = self.queries.len(),
            max_workers = self.max_workers,
            "Starting polling every {:?}",
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Received shutdown signal, polling stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(
                        queries = report.outcomes.len(),
                        delivered = report.delivered_records(),
                        failed = report.failed(),
                        "Polling cycle finished"
                    );
                }
            }
        }
    }

    /// Poll every query once.
    pub async fn run_cycle(&self) -> CycleReport {
        // Built up front so the stream is not generic over the spec borrow,
        // which keeps `run` spawnable.
        let polls: Vec<BoxFuture<'_, (String, PollOutcome)>> = self
            .queries
            .iter()
            .map(|spec| async move { (spec.id.clone(), self.poll_query(spec).await) }.boxed())
            .collect();
        let outcomes = stream::iter(polls)
            .buffer_unordered(self.max_workers)
            .collect()
            .await;
        CycleReport { outcomes }
    }

    /// Load checkpoint, fetch, deliver, advance.
    pub async fn poll_query(&self, spec: &QuerySpec) -> PollOutcome {
        if self.cancel.is_cancelled() {
            return PollOutcome::Skipped;
        }

        let checkpoint = if spec.is_snapshot() {
            None
        } else {
            match self.store.load(&spec.id).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    error!(query_id = %spec.id, "Failed to load checkpoint: {e:#}");
                    return PollOutcome::Failed(format!("{e:#}"));
                }
            }
        };

        let batch = match self
            .executor
            .fetch_batch(spec, checkpoint.as_deref())
            .await
        {
            Ok(batch) => batch,
            Err(e) if e.is_connection() => {
                warn!(query_id = %spec.id, "Database unavailable, retrying next tick: {e}");
                return PollOutcome::Failed(e.to_string());
            }
            Err(e) => {
                error!(query_id = %spec.id, "Query failed, skipping this tick: {e}");
                return PollOutcome::Failed(e.to_string());
            }
        };

        let records = batch.len();
        match self.delivery.deliver(&batch, &self.cancel).await {
            Ok(delivery) => {
                if let DeliveryOutcome::Delivered { checkpoint: Some(value), .. } = &delivery {
                    debug!(query_id = %spec.id, records, checkpoint = %value, "Checkpoint advanced");
                }
                PollOutcome::Completed { records, delivery }
            }
            Err(e) => {
                error!(query_id = %spec.id, "Delivery bookkeeping failed: {e:#}");
                PollOutcome::Failed(format!("{e:#}"))
            }
        }
    }
}
