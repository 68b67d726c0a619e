//! Receiver lifecycle
//!
//! Wires credentials, the connection pool, checkpoint storage and the
//! consumer into a running [`Scheduler`], and tears it all down once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use checkpoint::CheckpointStore;
use mysql_records_source::{
    resolve_profile, ConnectionManager, QueryExecutor, QueryRunner, QuerySpec, RdsTokenIssuer,
};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ReceiverConfig, DEFAULT_SHUTDOWN_GRACE_PERIOD};
use crate::delivery::{DeliveryController, RecordConsumer, RetryPolicy};
use crate::scheduler::Scheduler;

/// Runtime knobs taken from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverSettings {
    pub interval: Duration,
    pub max_workers: usize,
    pub retry: RetryPolicy,
    pub grace_period: Duration,
}

impl ReceiverSettings {
    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self {
            interval: config.collection_interval(),
            max_workers: config.max_db_workers(),
            retry: config.retry_policy(),
            grace_period: if config.shutdown_grace_period.is_zero() {
                DEFAULT_SHUTDOWN_GRACE_PERIOD
            } else {
                config.shutdown_grace_period
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// In-flight work finished within the grace period
    Graceful,
    /// The grace period expired and the scheduler was aborted
    Aborted,
}

pub struct Receiver {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    runner: Arc<dyn QueryRunner>,
    store: Arc<dyn CheckpointStore>,
    grace_period: Duration,
    stopped: OnceCell<ShutdownStatus>,
}

impl Receiver {
    /// Resolve credentials, open the pool and checkpoint store, and start
    /// polling.
    ///
    /// Configuration and credential errors are fatal. An unreachable
    /// database is not: the first ticks fail and polling keeps retrying.
    pub async fn start(
        config: &ReceiverConfig,
        consumer: Arc<dyn RecordConsumer>,
    ) -> anyhow::Result<Self> {
        let queries = config.validate()?;

        let opts = config.credential_opts();
        let profile = resolve_profile(&opts, &RdsTokenIssuer::new())
            .await
            .context("Failed to resolve database credentials")?;
        let manager = ConnectionManager::new(&profile, config.pool_limits())
            .context("Failed to build connection pool")?;
        if let Err(e) = manager.ping().await {
            warn!(
                "Database at {} is not reachable yet, polling will keep retrying: {e}",
                manager.endpoint()
            );
        }

        let store = checkpoint::open_store(&config.checkpoint_storage)
            .context("Failed to open checkpoint store")?;

        Ok(Self::from_parts(
            queries,
            Arc::new(manager),
            store,
            consumer,
            ReceiverSettings::from_config(config),
        ))
    }

    /// Start polling with already-built collaborators. Must be called from
    /// within a tokio runtime.
    pub fn from_parts(
        queries: Vec<QuerySpec>,
        runner: Arc<dyn QueryRunner>,
        store: Arc<dyn CheckpointStore>,
        consumer: Arc<dyn RecordConsumer>,
        settings: ReceiverSettings,
    ) -> Self {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(
            queries,
            QueryExecutor::new(runner.clone()),
            store.clone(),
            DeliveryController::new(consumer, store.clone(), settings.retry),
            cancel.clone(),
        )
        .with_interval(settings.interval)
        .with_max_workers(settings.max_workers);

        let task = tokio::spawn(scheduler.run());

        Self {
            cancel,
            task: Mutex::new(Some(task)),
            runner,
            store,
            grace_period: settings.grace_period,
            stopped: OnceCell::new(),
        }
    }

    /// Stop polling and release the connection pool.
    ///
    /// Safe to call any number of times from any number of tasks; the
    /// teardown runs once and every caller gets its result.
    pub async fn shutdown(&self) -> ShutdownStatus {
        *self.stopped.get_or_init(|| self.teardown()).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.initialized()
    }

    /// Current checkpoint of every incremental query that has advanced.
    pub async fn checkpoints(&self) -> anyhow::Result<BTreeMap<String, String>> {
        self.store.snapshot().await
    }

    async fn teardown(&self) -> ShutdownStatus {
        info!("Shutting down receiver");
        self.cancel.cancel();

        let mut status = ShutdownStatus::Graceful;
        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.grace_period, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Polling task ended abnormally: {e}"),
                Err(_) => {
                    warn!(
                        "In-flight polling did not finish within {:?}, aborting",
                        self.grace_period
                    );
                    task.abort();
                    status = ShutdownStatus::Aborted;
                }
            }
        }

        if let Err(e) = self.runner.close().await {
            warn!("Failed to close database connections: {e}");
        }
        info!("Receiver stopped");
        status
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
