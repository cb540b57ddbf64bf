use std::sync::Arc;

use casekeep_autosave::crypto::EncryptionHooks;
use casekeep_autosave::{
    AutosaveError, AutosaveState, CryptoError, ErrorKind, PasswordEncryption,
};
use pretty_assertions::assert_eq;

use crate::common::{Harness, TEST_KDF_ITERATIONS, sample_data};

fn hooks(password: &str) -> Arc<PasswordEncryption> {
    let hooks = Arc::new(PasswordEncryption::with_iterations(TEST_KDF_ITERATIONS));
    hooks.set_password(password);
    hooks
}

async fn encrypted_harness() -> Harness {
    let harness = Harness::connected().await;
    harness
        .engine
        .set_encryption_hooks(Some(hooks("right") as Arc<dyn EncryptionHooks>));
    assert!(harness.engine.save(sample_data("secret")).await);
    harness
}

#[tokio::test]
async fn encrypted_round_trip_through_reconnect() -> anyhow::Result<()> {
    let harness = encrypted_harness().await;

    let on_disk = harness.on_disk().unwrap();
    assert_eq!(on_disk["encrypted"], true);
    assert!(on_disk.get("cases").is_none());
    assert!(!std::fs::read_to_string(harness.data_path())?.contains("secret"));

    harness.engine.disconnect();
    assert!(harness.engine.connect_to_existing().await?);

    assert_eq!(harness.engine.read_file().await?, Some(sample_data("secret")));
    Ok(())
}

#[tokio::test]
async fn wrong_password_fails_with_typed_error() {
    let harness = encrypted_harness().await;
    let wrong = hooks("wrong");
    harness
        .engine
        .set_encryption_hooks(Some(Arc::clone(&wrong) as Arc<dyn EncryptionHooks>));

    let err = harness.engine.read_file().await.unwrap_err();

    assert!(matches!(
        err,
        AutosaveError::Decryption(CryptoError::DecryptionFailed)
    ));
    assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
    assert_eq!(harness.engine.status().status, AutosaveState::Error);
    assert!(!wrong.has_password());
}

#[tokio::test]
async fn missing_password_never_yields_ciphertext_as_data() {
    let harness = encrypted_harness().await;
    harness.engine.set_encryption_hooks(None);

    let err = harness.engine.read_file().await.unwrap_err();

    assert!(matches!(
        err,
        AutosaveError::Decryption(CryptoError::PasswordRequired)
    ));
}

#[tokio::test]
async fn encrypted_file_is_not_downgraded_to_plaintext() {
    let harness = encrypted_harness().await;
    harness.engine.set_encryption_hooks(None);
    let _ = harness.engine.read_file().await;

    assert!(!harness.engine.save(sample_data("leak")).await);

    assert_eq!(harness.on_disk().unwrap()["encrypted"], true);
    assert_eq!(harness.engine.status().status, AutosaveState::Error);
}

#[tokio::test]
async fn fresh_session_without_password_keeps_file_encrypted() -> anyhow::Result<()> {
    let harness = encrypted_harness().await;
    let engine = harness.sibling_engine();
    assert!(engine.connect_to_existing().await?);

    assert!(!engine.save(sample_data("leak")).await);

    let on_disk = harness.on_disk().unwrap();
    assert_eq!(on_disk["encrypted"], true);
    assert!(on_disk.get("cases").is_none());
    assert_eq!(engine.status().status, AutosaveState::Error);
    assert_eq!(harness.storage.writes(), 1);
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_caught_on_connect() -> anyhow::Result<()> {
    let harness = encrypted_harness().await;
    let engine = harness.sibling_engine();
    let wrong = hooks("wrong");
    engine.set_encryption_hooks(Some(Arc::clone(&wrong) as Arc<dyn EncryptionHooks>));

    assert!(engine.connect_to_existing().await?);

    assert_eq!(engine.status().status, AutosaveState::Error);
    assert!(!wrong.has_password());
    assert!(!engine.save(sample_data("leak")).await);
    assert_eq!(harness.on_disk().unwrap()["encrypted"], true);
    Ok(())
}

#[tokio::test]
async fn correct_password_recovers_after_failure() -> anyhow::Result<()> {
    let harness = encrypted_harness().await;
    harness
        .engine
        .set_encryption_hooks(Some(hooks("wrong") as Arc<dyn EncryptionHooks>));
    assert!(harness.engine.read_file().await.is_err());

    harness
        .engine
        .set_encryption_hooks(Some(hooks("right") as Arc<dyn EncryptionHooks>));

    assert_eq!(harness.engine.read_file().await?, Some(sample_data("secret")));
    assert_eq!(harness.engine.status().status, AutosaveState::Connected);
    assert!(harness.engine.save(sample_data("updated")).await);
    assert_eq!(harness.on_disk().unwrap()["encrypted"], true);
    Ok(())
}
