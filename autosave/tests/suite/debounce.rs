use std::sync::Arc;
use std::time::Duration;

use casekeep_autosave::{AutosaveConfig, AutosaveState};
use pretty_assertions::assert_eq;
use tokio::time::sleep;

use crate::common::{Harness, SlowHooks, fast_config, sample_data, wait_until};

#[tokio::test]
async fn burst_of_changes_writes_once() {
    let harness = Harness::connected().await;
    harness.engine.set_data_provider(|| Some(sample_data("c1")));

    for _ in 0..5 {
        harness.engine.notify_change();
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.storage.writes(), 1);
    assert_eq!(harness.on_disk().unwrap()["cases"][0]["id"], "c1");
}

#[tokio::test]
async fn save_now_skips_the_debounce() {
    let harness = Harness::connected().await;
    harness.engine.set_data_provider(|| Some(sample_data("c1")));

    harness.engine.notify_change();
    assert!(harness.engine.save_now().await);
    assert_eq!(harness.storage.writes(), 1);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.storage.writes(), 1);
}

#[tokio::test]
async fn periodic_save_fires_without_debounce() {
    let harness = Harness::with_config(AutosaveConfig {
        debounce_delay_ms: 10_000,
        save_interval_ms: 100,
        ..fast_config()
    });
    assert!(harness.engine.connect().await.unwrap());
    harness.engine.set_data_provider(|| Some(sample_data("c1")));

    harness.engine.notify_change();

    assert!(wait_until(Duration::from_secs(2), || harness.storage.writes() == 1).await);
    // Nothing dirty afterwards: later ticks are no-ops.
    sleep(Duration::from_millis(350)).await;
    assert_eq!(harness.storage.writes(), 1);
}

#[tokio::test]
async fn disconnect_cancels_armed_timer() {
    let harness = Harness::connected().await;
    harness.engine.set_data_provider(|| Some(sample_data("c1")));

    harness.engine.notify_change();
    harness.engine.disconnect();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.storage.attempts(), 0);
    assert!(harness.on_disk().is_none());
}

#[tokio::test]
async fn disconnect_discards_in_flight_write() {
    let harness = Harness::connected().await;
    harness
        .engine
        .set_encryption_hooks(Some(Arc::new(SlowHooks {
            delay: Duration::from_millis(200),
        })));
    harness.engine.set_data_provider(|| Some(sample_data("c1")));

    harness.engine.notify_change();
    assert!(
        wait_until(Duration::from_secs(2), || {
            harness.engine.status().status == AutosaveState::Saving
        })
        .await
    );
    harness.engine.disconnect();
    sleep(Duration::from_millis(400)).await;

    assert_eq!(harness.storage.attempts(), 0);
    assert!(harness.on_disk().is_none());
    assert_eq!(harness.engine.metrics().discarded, 1);
    let status = harness.engine.status();
    assert_eq!(status.status, AutosaveState::Disconnected);
    assert_eq!(status.pending_writes, 0);
}

#[tokio::test]
async fn disconnect_during_permission_check_discards_write() {
    let harness = Harness::connected().await;
    harness.broker.set_query_delay(Duration::from_millis(200));

    let engine = harness.engine.clone();
    let save = tokio::spawn(async move { engine.save(sample_data("c1")).await });
    sleep(Duration::from_millis(50)).await;
    harness.engine.disconnect();

    assert!(!save.await.unwrap());
    assert_eq!(harness.storage.attempts(), 0);
    assert!(harness.on_disk().is_none());
    assert_eq!(harness.engine.metrics().discarded, 1);
    assert_eq!(harness.engine.status().status, AutosaveState::Disconnected);
}

#[tokio::test]
async fn flush_without_provider_writes_nothing() {
    let harness = Harness::connected().await;

    harness.engine.notify_change();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.storage.attempts(), 0);
    assert_eq!(harness.engine.status().status, AutosaveState::Connected);
}
