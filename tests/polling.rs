//! Polling cycles against an in-process fake database

mod common;

use std::sync::Arc;
use std::time::Duration;

use checkpoint::{CheckpointStore, FilesystemStore, MemoryStore};
use common::{FakeRunner, RecordingConsumer};
use mysql_records::{
    DeliveryController, DeliveryError, DeliveryOutcome, PollOutcome, RecordConsumer, RetryPolicy,
    Scheduler,
};
use mysql_records_source::{CursorType, QueryExecutor, QuerySpec};
use tokio_util::sync::CancellationToken;

fn departments(runner: &FakeRunner) -> QuerySpec {
    runner.add_table("Q1", &["dept_no", "dept_name"], None);
    runner.insert("Q1", &[Some("d001"), Some("Marketing")]);
    runner.insert("Q1", &[Some("d002"), Some("Finance")]);
    QuerySpec::snapshot("Q1", "Select * from departments")
}

fn dept_manager(runner: &FakeRunner) -> QuerySpec {
    runner.add_table("Q2", &["emp_no", "dept_no"], Some("emp_no"));
    for (emp_no, dept_no) in [("1", "d001"), ("3", "d001"), ("4", "d002"), ("7", "d002")] {
        runner.insert("Q2", &[Some(emp_no), Some(dept_no)]);
    }
    QuerySpec::incremental(
        "Q2",
        "Select * from dept_manager",
        "emp_no",
        CursorType::Number,
        Some("3".to_string()),
    )
    .unwrap()
}

fn scheduler(
    queries: Vec<QuerySpec>,
    runner: Arc<FakeRunner>,
    store: Arc<dyn CheckpointStore>,
    consumer: Arc<dyn RecordConsumer>,
) -> Scheduler {
    let delivery = DeliveryController::new(
        consumer,
        store.clone(),
        RetryPolicy {
            delay: Duration::from_millis(10),
            max_retries: 2,
        },
    );
    Scheduler::new(
        queries,
        QueryExecutor::new(runner),
        store,
        delivery,
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_snapshot_and_incremental_first_cycle() {
    let runner = FakeRunner::new();
    let queries = vec![departments(&runner), dept_manager(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::new();
    let scheduler = scheduler(queries, runner.clone(), store.clone(), consumer.clone());

    let report = scheduler.run_cycle().await;
    assert_eq!(report.failed(), 0);
    assert_eq!(report.delivered_records(), 4);

    assert_eq!(consumer.keys("Q1"), ["Q1_record1", "Q1_record2"]);
    assert_eq!(consumer.keys("Q2"), ["Q2_record1", "Q2_record2"]);
    assert_eq!(consumer.column("Q2", "emp_no"), ["4", "7"]);

    assert!(runner
        .statements()
        .contains(&"Select * from dept_manager where emp_no > 3 order by emp_no asc;".to_string()));
    assert_eq!(store.load("Q2").await.unwrap(), Some("7".to_string()));
    assert_eq!(store.load("Q1").await.unwrap(), None);
}

#[tokio::test]
async fn test_checkpoint_is_monotonic_and_tracks_max_delivered() {
    let runner = FakeRunner::new();
    let queries = vec![dept_manager(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::new();
    let scheduler = scheduler(queries, runner.clone(), store.clone(), consumer.clone());

    let mut history = Vec::new();
    for new_rows in [vec![], vec!["9", "12"], vec![], vec!["13"]] {
        for emp_no in new_rows {
            runner.insert("Q2", &[Some(emp_no), Some("d003")]);
        }
        scheduler.run_cycle().await;
        let checkpoint: i64 = store.load("Q2").await.unwrap().unwrap().parse().unwrap();
        history.push(checkpoint);
    }

    assert_eq!(history, [7, 12, 12, 13]);
    assert!(history.windows(2).all(|w| w[0] <= w[1]));

    let delivered: Vec<i64> = consumer
        .column("Q2", "emp_no")
        .iter()
        .map(|v| v.parse().unwrap())
        .collect();
    assert_eq!(delivered, [4, 7, 9, 12, 13]);
    assert_eq!(delivered.iter().max(), history.last());
}

#[tokio::test]
async fn test_unchanged_source_yields_empty_batch() {
    let runner = FakeRunner::new();
    let queries = vec![dept_manager(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::new();
    let scheduler = scheduler(queries, runner.clone(), store.clone(), consumer.clone());

    scheduler.run_cycle().await;
    let report = scheduler.run_cycle().await;

    assert_eq!(
        report.outcome("Q2"),
        Some(&PollOutcome::Completed {
            records: 0,
            delivery: DeliveryOutcome::Empty
        })
    );
    assert_eq!(consumer.batches("Q2"), 1);
    assert_eq!(
        runner.statements().last().unwrap(),
        "Select * from dept_manager where emp_no > 7 order by emp_no asc;"
    );
}

#[tokio::test]
async fn test_snapshot_query_returns_full_set_every_cycle() {
    let runner = FakeRunner::new();
    let queries = vec![departments(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::new();
    let scheduler = scheduler(queries, runner.clone(), store.clone(), consumer.clone());

    scheduler.run_cycle().await;
    scheduler.run_cycle().await;

    assert_eq!(
        consumer.keys("Q1"),
        ["Q1_record1", "Q1_record2", "Q1_record1", "Q1_record2"]
    );
    assert!(store.snapshot().await.unwrap().is_empty());
    assert!(runner
        .statements()
        .iter()
        .all(|sql| sql == "Select * from departments"));
}

#[tokio::test]
async fn test_failing_query_does_not_block_others() {
    let runner = FakeRunner::new();
    let queries = vec![departments(&runner), dept_manager(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::new();
    let scheduler = scheduler(queries, runner.clone(), store.clone(), consumer.clone());

    runner.fail("Q2");
    let report = scheduler.run_cycle().await;
    assert!(matches!(report.outcome("Q2"), Some(PollOutcome::Failed(_))));
    assert_eq!(consumer.keys("Q1").len(), 2);
    assert_eq!(store.load("Q2").await.unwrap(), None);

    runner.heal("Q2");
    let report = scheduler.run_cycle().await;
    assert_eq!(report.failed(), 0);
    assert_eq!(consumer.column("Q2", "emp_no"), ["4", "7"]);
}

#[tokio::test]
async fn test_dropped_batch_is_fetched_again() {
    let runner = FakeRunner::new();
    let queries = vec![dept_manager(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer =
        RecordingConsumer::failing_with(vec![DeliveryError::Permanent("rejected".into())]);
    let scheduler = scheduler(queries, runner.clone(), store.clone(), consumer.clone());

    let report = scheduler.run_cycle().await;
    assert!(matches!(
        report.outcome("Q2"),
        Some(PollOutcome::Completed {
            delivery: DeliveryOutcome::Dropped { attempts: 1, .. },
            ..
        })
    ));
    assert_eq!(store.load("Q2").await.unwrap(), None);

    scheduler.run_cycle().await;
    assert_eq!(consumer.keys("Q2"), ["Q2_record1", "Q2_record2"]);
    assert_eq!(store.load("Q2").await.unwrap(), Some("7".to_string()));
}

#[tokio::test]
async fn test_transient_failures_retried_within_cycle() {
    let runner = FakeRunner::new();
    let queries = vec![dept_manager(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::failing_with(vec![
        DeliveryError::Transient("busy".into()),
        DeliveryError::Transient("busy".into()),
    ]);
    let scheduler = scheduler(queries, runner.clone(), store.clone(), consumer.clone());

    let report = scheduler.run_cycle().await;
    assert_eq!(
        report.outcome("Q2"),
        Some(&PollOutcome::Completed {
            records: 2,
            delivery: DeliveryOutcome::Delivered {
                attempts: 3,
                checkpoint: Some("7".to_string())
            }
        })
    );
    // retries reuse the fetched batch
    assert_eq!(runner.statements().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_bounds_concurrency() {
    let runner = FakeRunner::with_delay(Duration::from_millis(100));
    let queries: Vec<QuerySpec> = (1..=6)
        .map(|n| {
            let id = format!("S{n}");
            runner.add_table(&id, &["n"], None);
            runner.insert(&id, &[Some("1")]);
            QuerySpec::snapshot(id, "select n from numbers")
        })
        .collect();
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::new();
    let scheduler = scheduler(queries, runner.clone(), store, consumer).with_max_workers(2);

    let report = scheduler.run_cycle().await;

    assert_eq!(report.outcomes.len(), 6);
    assert_eq!(report.delivered_records(), 6);
    assert_eq!(runner.max_in_flight(), 2);
}

#[tokio::test]
async fn test_filesystem_checkpoints_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let runner = FakeRunner::new();
    let spec = dept_manager(&runner);
    {
        let store = Arc::new(FilesystemStore::open(dir.path()).unwrap());
        let scheduler = scheduler(
            vec![spec.clone()],
            runner.clone(),
            store,
            RecordingConsumer::new(),
        );
        scheduler.run_cycle().await;
    }

    runner.insert("Q2", &[Some("8"), Some("d004")]);
    let store = Arc::new(FilesystemStore::open(dir.path()).unwrap());
    assert_eq!(store.load("Q2").await.unwrap(), Some("7".to_string()));

    let consumer = RecordingConsumer::new();
    let scheduler = scheduler(vec![spec], runner.clone(), store.clone(), consumer.clone());
    scheduler.run_cycle().await;

    assert_eq!(consumer.column("Q2", "emp_no"), ["8"]);
    assert_eq!(store.load("Q2").await.unwrap(), Some("8".to_string()));
}

#[tokio::test]
async fn test_connection_errors_recover_next_cycle() {
    let runner = FakeRunner::new();
    let queries = vec![departments(&runner), dept_manager(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::new();
    let scheduler = scheduler(queries, runner.clone(), store.clone(), consumer.clone());

    runner.set_offline(true);
    let report = scheduler.run_cycle().await;
    assert_eq!(report.failed(), 2);
    match report.outcome("Q2") {
        Some(PollOutcome::Failed(reason)) => assert!(reason.contains("connection"), "{reason}"),
        other => panic!("expected connection failure, got {other:?}"),
    }
    assert_eq!(store.load("Q2").await.unwrap(), None);
    assert_eq!(consumer.batches("Q1"), 0);

    runner.set_offline(false);
    let report = scheduler.run_cycle().await;
    assert_eq!(report.failed(), 0);
    assert_eq!(consumer.keys("Q1").len(), 2);
    assert_eq!(store.load("Q2").await.unwrap(), Some("7".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_is_spawnable_and_stops_on_cancel() {
    let runner = FakeRunner::new();
    let queries = vec![departments(&runner), dept_manager(&runner)];
    let store = Arc::new(MemoryStore::new());
    let consumer = RecordingConsumer::new();
    let cancel = CancellationToken::new();
    let delivery = DeliveryController::new(
        consumer.clone(),
        store.clone(),
        RetryPolicy {
            delay: Duration::from_millis(10),
            max_retries: 2,
        },
    );
    let scheduler = Scheduler::new(
        queries,
        QueryExecutor::new(runner.clone()),
        store.clone(),
        delivery,
        cancel.clone(),
    )
    .with_interval(Duration::from_secs(5))
    .with_max_workers(2);

    let task = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_secs(6)).await;
    cancel.cancel();
    task.await.unwrap();

    // ticks at 0s and 5s
    assert_eq!(consumer.batches("Q1"), 2);
    assert_eq!(store.load("Q2").await.unwrap(), Some("7".to_string()));
}
