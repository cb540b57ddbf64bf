use std::sync::{Arc, Mutex};

use casekeep_autosave::{
    AutosaveConfigUpdate, AutosaveEngine, AutosaveError, AutosaveState, ErrorKind, HandleStore,
    NormalizedFileData, PermissionState, StaticFolderPicker,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use crate::common::{Harness, sample_data};

#[tokio::test]
async fn new_engine_starts_disconnected() {
    let harness = Harness::new();
    let status = harness.engine.status();

    assert_eq!(status.status, AutosaveState::Disconnected);
    assert_eq!(status.pending_writes, 0);
    assert_eq!(status.consecutive_failures, 0);
    assert!(!harness.engine.is_connected());
}

#[tokio::test]
async fn save_disconnect_reconnect_read_round_trip() -> anyhow::Result<()> {
    let harness = Harness::new();
    assert!(harness.engine.connect().await?);
    assert_eq!(harness.engine.status().status, AutosaveState::Connected);
    assert_eq!(harness.engine.read_file().await?, None);

    let data = NormalizedFileData::with_cases(vec![json!({"id": "c1"})]);
    assert!(harness.engine.save(data.clone()).await);
    harness.engine.disconnect();
    assert_eq!(harness.engine.status().status, AutosaveState::Disconnected);

    assert!(harness.engine.connect_to_existing().await?);
    let read = harness.engine.read_file().await?;

    assert_eq!(read, Some(data));
    Ok(())
}

#[tokio::test]
async fn persisted_handle_survives_a_new_engine() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    assert!(harness.engine.save(sample_data("c1")).await);

    let restarted = harness.sibling_engine();
    assert!(restarted.connect_to_existing().await?);

    assert_eq!(restarted.read_file().await?, Some(sample_data("c1")));
    Ok(())
}

#[tokio::test]
async fn cancelled_picker_is_not_an_error() {
    let home = TempDir::new().unwrap();
    let engine = AutosaveEngine::builder()
        .folder_picker(Arc::new(StaticFolderPicker::cancelled()))
        .handle_store(HandleStore::with_path(home.path().join("handle.json")))
        .build()
        .unwrap();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let _errors = engine.subscribe_errors(move |report| sink.lock().unwrap().push(report.kind));

    let connected = engine.connect().await.unwrap();

    assert!(!connected);
    assert_eq!(engine.status().status, AutosaveState::Disconnected);
    assert!(reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_without_persisted_handle_reports_missing_handle() {
    let harness = Harness::new();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let _errors = harness
        .engine
        .subscribe_errors(move |report| sink.lock().unwrap().push(report.kind));

    let err = harness.engine.connect_to_existing().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MissingHandle);
    assert_eq!(*reports.lock().unwrap(), vec![ErrorKind::MissingHandle]);
    assert_eq!(harness.engine.status().status, AutosaveState::Error);
}

#[tokio::test]
async fn denied_folder_fails_connect() {
    let harness = Harness::new();
    harness.broker.set(PermissionState::Denied);

    let err = harness.engine.connect().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let status = harness.engine.status();
    assert_eq!(status.status, AutosaveState::Error);
    assert_eq!(status.permission_status, PermissionState::Denied);
}

#[tokio::test]
async fn operations_require_a_connection() {
    let harness = Harness::new();

    assert!(matches!(
        harness.engine.read_file().await,
        Err(AutosaveError::MissingHandle)
    ));
    assert!(matches!(
        harness.engine.list_data_files().await,
        Err(AutosaveError::MissingHandle)
    ));
    assert!(!harness.engine.save(sample_data("c1")).await);
    assert!(!harness.engine.save_now().await);
}

#[tokio::test]
async fn lists_and_reads_sibling_documents() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    assert!(harness.engine.save(sample_data("main")).await);
    std::fs::write(
        harness.folder.path().join("backup.json"),
        serde_json::to_vec(&sample_data("backup"))?,
    )?;
    std::fs::write(harness.folder.path().join("notes.txt"), "ignored")?;

    let files = harness.engine.list_data_files().await?;
    assert_eq!(
        files,
        vec!["backup.json".to_string(), "case-tracker-data.json".to_string()]
    );

    let backup = harness.engine.read_named_file("backup.json").await?;
    assert_eq!(backup, Some(sample_data("backup")));
    // The connected file is unchanged.
    assert_eq!(harness.engine.read_file().await?, Some(sample_data("main")));

    assert!(matches!(
        harness.engine.read_named_file("../escape.json").await,
        Err(AutosaveError::InvalidFileName(_))
    ));
    Ok(())
}

#[tokio::test]
async fn legacy_array_export_is_read_as_cases() -> anyhow::Result<()> {
    let harness = Harness::connected().await;
    std::fs::write(harness.data_path(), r#"[{"id":"c1"},{"id":"c2"}]"#)?;

    let data = harness.engine.read_file().await?.unwrap();

    assert_eq!(data.cases, vec![json!({"id": "c1"}), json!({"id": "c2"})]);
    Ok(())
}

#[tokio::test]
async fn corrupt_file_surfaces_read_failure() {
    let harness = Harness::connected().await;
    std::fs::write(harness.data_path(), "{ not json").unwrap();

    let err = harness.engine.read_file().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ReadFailed);
    assert_eq!(harness.engine.status().status, AutosaveState::Error);
}

#[tokio::test]
async fn data_load_callback_runs_on_connect() {
    let harness = Harness::connected().await;
    assert!(harness.engine.save(sample_data("c1")).await);
    harness.engine.disconnect();

    let loaded = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&loaded);
    harness
        .engine
        .set_data_load_callback(move |data| *sink.lock().unwrap() = Some(data.clone()));
    assert!(harness.engine.connect_to_existing().await.unwrap());

    assert_eq!(*loaded.lock().unwrap(), Some(sample_data("c1")));
}

#[tokio::test]
async fn disabling_autosave_reports_idle() {
    let harness = Harness::connected().await;

    harness
        .engine
        .update_config(&AutosaveConfigUpdate {
            enabled: Some(false),
            ..AutosaveConfigUpdate::default()
        })
        .unwrap();
    assert_eq!(harness.engine.status().status, AutosaveState::Idle);

    // Manual saves still work while idle.
    assert!(harness.engine.save(sample_data("c1")).await);
    assert_eq!(harness.engine.status().status, AutosaveState::Idle);

    harness
        .engine
        .update_config(&AutosaveConfigUpdate {
            enabled: Some(true),
            ..AutosaveConfigUpdate::default()
        })
        .unwrap();
    assert_eq!(harness.engine.status().status, AutosaveState::Connected);
}

#[tokio::test]
async fn invalid_config_update_is_rejected() {
    let harness = Harness::connected().await;
    let before = harness.engine.config();

    let result = harness.engine.update_config(&AutosaveConfigUpdate {
        max_retries: Some(0),
        ..AutosaveConfigUpdate::default()
    });

    assert!(matches!(result, Err(AutosaveError::Config(_))));
    assert_eq!(harness.engine.config(), before);
}

#[tokio::test]
async fn status_stream_follows_transitions() {
    let harness = Harness::new();
    let mut rx = harness.engine.watch_status();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = harness
        .engine
        .subscribe_status(move |snapshot| sink.lock().unwrap().push(snapshot.status));

    harness.engine.connect().await.unwrap();
    harness.engine.save(sample_data("c1")).await;

    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().status, AutosaveState::Connected);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&AutosaveState::Connecting));
    assert!(seen.contains(&AutosaveState::Saving));
    assert_eq!(seen.last(), Some(&AutosaveState::Connected));
    assert!(harness.engine.status().last_save_time.is_some());
}
