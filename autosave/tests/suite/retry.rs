use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use casekeep_autosave::{AutosaveState, ErrorKind, ErrorReport};
use pretty_assertions::assert_eq;

use crate::common::{Harness, sample_data};

#[tokio::test]
async fn exhausted_retries_set_error_and_success_resets() {
    let harness = Harness::connected().await;
    let reports: Arc<Mutex<Vec<ErrorReport>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let _errors = harness
        .engine
        .subscribe_errors(move |report| sink.lock().unwrap().push(report.clone()));
    harness.storage.fail_next(io::ErrorKind::TimedOut, 3);

    assert!(!harness.engine.save(sample_data("c1")).await);

    let status = harness.engine.status();
    assert_eq!(status.status, AutosaveState::Error);
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(status.pending_writes, 0);
    assert_eq!(harness.storage.attempts(), 3);
    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ErrorKind::WriteFailed);
        assert!(reports[0].retryable);
    }

    assert!(harness.engine.save(sample_data("c1")).await);

    let status = harness.engine.status();
    assert_eq!(status.status, AutosaveState::Connected);
    assert_eq!(status.consecutive_failures, 0);
    let metrics = harness.engine.metrics();
    assert_eq!(metrics.saves_failed, 1);
    assert_eq!(metrics.saves_succeeded, 1);
    assert_eq!(metrics.retries, 2);
}

#[tokio::test]
async fn transient_failures_recover_within_budget() {
    let harness = Harness::connected().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = harness
        .engine
        .subscribe_status(move |snapshot| sink.lock().unwrap().push(snapshot.status));
    harness.storage.fail_next(io::ErrorKind::Interrupted, 2);

    assert!(harness.engine.save(sample_data("c1")).await);

    assert_eq!(harness.storage.attempts(), 3);
    assert_eq!(harness.engine.status().consecutive_failures, 0);
    assert!(seen.lock().unwrap().contains(&AutosaveState::Retrying));
}

#[tokio::test]
async fn quota_errors_are_not_retried() {
    let harness = Harness::connected().await;
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let _errors = harness
        .engine
        .subscribe_errors(move |report| sink.lock().unwrap().push(report.clone()));
    harness.storage.fail_next(io::ErrorKind::StorageFull, 1);

    assert!(!harness.engine.save(sample_data("c1")).await);

    assert_eq!(harness.storage.attempts(), 1);
    let status = harness.engine.status();
    assert_eq!(status.status, AutosaveState::Error);
    assert_eq!(status.consecutive_failures, 1);
    let reports = reports.lock().unwrap();
    assert_eq!(reports[0].kind, ErrorKind::QuotaExceeded);
    assert!(!reports[0].retryable);
}

#[tokio::test]
async fn concurrent_saves_run_one_at_a_time() {
    let harness = Harness::connected().await;
    harness.storage.set_write_delay(Duration::from_millis(50));
    let max_pending = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&max_pending);
    let _subscription = harness.engine.subscribe_status(move |snapshot| {
        let mut max = sink.lock().unwrap();
        *max = (*max).max(snapshot.pending_writes);
    });

    let engine = &harness.engine;
    let (a, b, c) = tokio::join!(
        engine.save(sample_data("a")),
        engine.save(sample_data("b")),
        engine.save(sample_data("c")),
    );

    assert!(a && b && c);
    assert_eq!(harness.storage.max_in_flight(), 1);
    assert_eq!(harness.storage.writes(), 3);
    assert!(*max_pending.lock().unwrap() >= 2);
    assert_eq!(harness.engine.status().pending_writes, 0);
    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c");
}

#[tokio::test]
async fn external_modification_is_retried_and_overwritten() {
    let harness = Harness::connected().await;
    assert!(harness.engine.save(sample_data("c1")).await);

    let file = std::fs::File::options()
        .write(true)
        .open(harness.data_path())
        .unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH).unwrap();
    drop(file);

    assert!(harness.engine.save(sample_data("c2")).await);

    assert_eq!(harness.engine.metrics().retries, 1);
    assert_eq!(harness.engine.status().consecutive_failures, 0);
    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c2");
}
