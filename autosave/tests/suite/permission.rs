use std::sync::{Arc, Mutex};

use casekeep_autosave::{AutosaveError, AutosaveState, ErrorKind, PermissionState};
use pretty_assertions::assert_eq;

use crate::common::{Harness, sample_data};

#[tokio::test]
async fn revoked_permission_waits_then_flushes_on_regrant() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    assert!(harness.engine.save(sample_data("c1")).await);

    harness.broker.set(PermissionState::Denied);
    assert!(!harness.engine.save(sample_data("c2")).await);

    let status = harness.engine.status();
    assert_eq!(status.status, AutosaveState::Waiting);
    assert_eq!(status.permission_status, PermissionState::Denied);
    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c1");

    harness.broker.set(PermissionState::Granted);
    assert!(harness.engine.ensure_permission().await?);

    let status = harness.engine.status();
    assert_eq!(status.status, AutosaveState::Connected);
    assert_eq!(status.permission_status, PermissionState::Granted);
    assert_eq!(status.pending_writes, 0);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c2");
    Ok(())
}

#[tokio::test]
async fn save_now_reports_a_parked_write_as_unsaved() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    harness.engine.set_data_provider(|| Some(sample_data("c1")));
    harness.broker.set(PermissionState::Denied);

    assert!(!harness.engine.save_now().await);

    assert_eq!(harness.engine.status().status, AutosaveState::Waiting);
    assert!(harness.on_disk().is_none());
    assert_eq!(harness.storage.attempts(), 0);

    harness.broker.set(PermissionState::Granted);
    assert!(harness.engine.ensure_permission().await?);
    assert!(harness.engine.save_now().await);
    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c1");
    Ok(())
}

#[tokio::test]
async fn latest_write_wins_while_waiting() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    harness.broker.set(PermissionState::Denied);

    assert!(!harness.engine.save(sample_data("c2")).await);
    assert!(!harness.engine.save(sample_data("c3")).await);
    // The second save was parked without touching storage.
    assert_eq!(harness.storage.attempts(), 0);

    harness.broker.set(PermissionState::Granted);
    assert!(harness.engine.ensure_permission().await?);

    assert_eq!(harness.storage.writes(), 1);
    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c3");
    Ok(())
}

#[tokio::test]
async fn ensure_permission_stays_waiting_while_denied() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    harness.broker.set(PermissionState::Denied);
    assert!(!harness.engine.save(sample_data("c1")).await);

    assert!(!harness.engine.ensure_permission().await?);

    assert_eq!(harness.engine.status().status, AutosaveState::Waiting);
    assert!(harness.on_disk().is_none());
    Ok(())
}

#[tokio::test]
async fn revoked_read_reports_permission_denied() {
    let harness = Harness::connected().await;
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let _errors = harness
        .engine
        .subscribe_errors(move |report| sink.lock().unwrap().push(report.kind));
    harness.broker.set(PermissionState::Prompt);

    let err = harness.engine.read_file().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(harness.engine.status().status, AutosaveState::Waiting);
    assert_eq!(*reports.lock().unwrap(), vec![ErrorKind::PermissionDenied]);
}

#[tokio::test]
async fn ensure_permission_needs_a_handle() {
    let harness = Harness::new();

    assert!(matches!(
        harness.engine.ensure_permission().await,
        Err(AutosaveError::MissingHandle)
    ));
}

#[tokio::test]
async fn disconnect_drops_parked_write() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    assert!(harness.engine.save(sample_data("c1")).await);
    harness.broker.set(PermissionState::Denied);
    assert!(!harness.engine.save(sample_data("c2")).await);

    harness.engine.disconnect();
    harness.broker.set(PermissionState::Granted);
    assert!(harness.engine.connect_to_existing().await?);

    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c1");
    Ok(())
}

#[tokio::test]
async fn reconnect_replays_parked_write() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    harness.broker.set(PermissionState::Denied);
    assert!(!harness.engine.save(sample_data("c2")).await);

    harness.broker.set(PermissionState::Granted);
    assert!(harness.engine.connect_to_existing().await?);

    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c2");
    assert_eq!(harness.engine.status().status, AutosaveState::Connected);
    Ok(())
}
