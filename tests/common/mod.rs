//! In-process fakes for the database and the downstream consumer
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mysql_records::{DeliveryError, RecordConsumer};
use mysql_records_source::{Batch, Error, QueryRunner, RawResultSet};

struct FakeTable {
    columns: Vec<String>,
    cursor: Option<usize>,
    rows: Vec<Vec<Option<String>>>,
}

/// Answers queries from in-memory tables, one table per query id.
///
/// Understands the `<cursor> > <literal>` predicate the executor appends and
/// returns matching rows in ascending cursor order.
#[derive(Default)]
pub struct FakeRunner {
    tables: Mutex<HashMap<String, FakeTable>>,
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    statements: Mutex<Vec<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn add_table(&self, query_id: &str, columns: &[&str], cursor: Option<&str>) {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let cursor = cursor.and_then(|name| columns.iter().position(|c| c == name));
        self.tables.lock().unwrap().insert(
            query_id.to_string(),
            FakeTable {
                columns,
                cursor,
                rows: Vec::new(),
            },
        );
    }

    pub fn insert(&self, query_id: &str, row: &[Option<&str>]) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(query_id).expect("unknown table");
        table
            .rows
            .push(row.iter().map(|v| v.map(str::to_string)).collect());
    }

    pub fn fail(&self, query_id: &str) {
        self.failing.lock().unwrap().insert(query_id.to_string());
    }

    pub fn heal(&self, query_id: &str) {
        self.failing.lock().unwrap().remove(query_id);
    }

    /// While offline every fetch fails the way a dropped pool does.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn answer(&self, query_id: &str, sql: &str) -> Result<RawResultSet, Error> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Connection(mysql_async::Error::Driver(
                mysql_async::DriverError::PoolDisconnected,
            )));
        }
        if self.failing.lock().unwrap().contains(query_id) {
            return Err(Error::ResultSet {
                query_id: query_id.to_string(),
                reason: "table is locked".to_string(),
            });
        }

        let tables = self.tables.lock().unwrap();
        let table = tables.get(query_id).ok_or_else(|| Error::ResultSet {
            query_id: query_id.to_string(),
            reason: "no such table".to_string(),
        })?;

        let mut rows = table.rows.clone();
        if let (Some(index), Some(bound)) = (table.cursor, lower_bound(sql)) {
            rows.retain(|row| row[index].as_deref().is_some_and(|v| greater(v, &bound)));
            rows.sort_by(|a, b| compare(a[index].as_deref(), b[index].as_deref()));
        }

        Ok(RawResultSet {
            columns: table.columns.clone(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|v| v.map(String::into_bytes)).collect())
                .collect(),
        })
    }
}

fn lower_bound(sql: &str) -> Option<String> {
    let start = sql.rfind(" > ")? + 3;
    let end = sql[start..].find(" order by")? + start;
    Some(sql[start..end].trim_matches('\'').to_string())
}

fn greater(value: &str, bound: &str) -> bool {
    match (value.parse::<f64>(), bound.parse::<f64>()) {
        (Ok(v), Ok(b)) => v > b,
        _ => value > bound,
    }
}

fn compare(a: Option<&str>, b: Option<&str>) -> std::cmp::Ordering {
    match (a.and_then(|v| v.parse::<f64>().ok()), b.and_then(|v| v.parse::<f64>().ok())) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => a.cmp(&b),
    }
}

#[async_trait]
impl QueryRunner for FakeRunner {
    async fn fetch(&self, query_id: &str, sql: &str) -> Result<RawResultSet, Error> {
        self.statements.lock().unwrap().push(sql.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.answer(query_id, sql);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(&self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records accepted batches; scripted errors are returned first, in order.
#[derive(Default)]
pub struct RecordingConsumer {
    accepted: Mutex<Vec<Batch>>,
    scripted: Mutex<VecDeque<DeliveryError>>,
    always: Option<DeliveryError>,
}

impl RecordingConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_with(errors: Vec<DeliveryError>) -> Arc<Self> {
        Arc::new(Self {
            scripted: Mutex::new(errors.into()),
            ..Self::default()
        })
    }

    pub fn always_failing(error: DeliveryError) -> Arc<Self> {
        Arc::new(Self {
            always: Some(error),
            ..Self::default()
        })
    }

    /// Keys of every accepted record for `query_id`, in delivery order.
    pub fn keys(&self, query_id: &str) -> Vec<String> {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.query_id == query_id)
            .flat_map(|b| b.records.iter().map(|r| r.key.clone()))
            .collect()
    }

    /// Values of `column` in every accepted record for `query_id`.
    pub fn column(&self, query_id: &str, column: &str) -> Vec<String> {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.query_id == query_id)
            .flat_map(|b| b.records.iter())
            .map(|r| r.field(column).unwrap().unwrap_or_default())
            .collect()
    }

    pub fn batches(&self, query_id: &str) -> usize {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.query_id == query_id)
            .count()
    }
}

#[async_trait]
impl RecordConsumer for RecordingConsumer {
    async fn consume(&self, batch: &Batch) -> Result<(), DeliveryError> {
        if let Some(error) = &self.always {
            return Err(error.clone());
        }
        if let Some(error) = self.scripted.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.accepted.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Consumer that never returns.
pub struct StuckConsumer;

#[async_trait]
impl RecordConsumer for StuckConsumer {
    async fn consume(&self, _batch: &Batch) -> Result<(), DeliveryError> {
        std::future::pending().await
    }
}
