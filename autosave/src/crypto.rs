//! Optional encryption at rest.
//!
//! Keys are derived with PBKDF2-HMAC-SHA256 from a password that only ever
//! lives in memory; the salt and iteration count travel in the file header.
//! Payloads are sealed with AES-256-GCM under a fresh random IV per write.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::data::{FileDocument, NormalizedFileData};

pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

const PAYLOAD_VERSION: u32 = 1;
const ALGORITHM: &str = "AES-256-GCM";
const KDF: &str = "PBKDF2-SHA256";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("file is encrypted and no password is set")]
    PasswordRequired,

    /// Wrong key or tampered ciphertext. AES-GCM cannot tell them apart.
    #[error("decryption failed: wrong password or corrupted data")]
    DecryptionFailed,

    #[error("malformed encrypted payload: {0}")]
    InvalidPayload(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed")]
    Encryption,
}

/// Session key derived from the user's password.
///
/// Bound to the salt and iteration count it was derived with. Zeroed on drop.
pub struct DerivedKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
    salt: Vec<u8>,
    iterations: u32,
}

impl DerivedKey {
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn matches(&self, salt: &[u8], iterations: u32) -> bool {
        self.salt == salt && self.iterations == iterations
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.bytes.as_slice()))
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"<redacted>")
            .field("iterations", &self.iterations)
            .finish()
    }
}

pub fn random_salt() -> [u8; SALT_LEN] {
    rand::random()
}

/// Derive a 256-bit key. CPU-bound; run it off the async executor.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Result<DerivedKey, CryptoError> {
    if salt.is_empty() {
        return Err(CryptoError::KeyDerivation("salt is empty".to_string()));
    }
    if iterations == 0 {
        return Err(CryptoError::KeyDerivation(
            "iteration count must be positive".to_string(),
        ));
    }

    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, bytes.as_mut_slice());
    Ok(DerivedKey {
        bytes,
        salt: salt.to_vec(),
        iterations,
    })
}

/// Encrypted envelope as written to disk.
///
/// Only [`encrypt`] produces one and only [`decrypt`] opens one; fields are
/// not settable from outside this module.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    encrypted: bool,
    version: u32,
    algorithm: String,
    kdf: String,
    iterations: u32,
    salt: String,
    iv: String,
    auth_tag: String,
    ciphertext: String,
}

impl fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("iterations", &self.iterations)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl EncryptedPayload {
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn salt(&self) -> Result<Vec<u8>, CryptoError> {
        decode_field("salt", &self.salt)
    }

    fn validate_header(&self) -> Result<(), CryptoError> {
        if !self.encrypted {
            return Err(CryptoError::InvalidPayload("missing encrypted marker".to_string()));
        }
        if self.algorithm != ALGORITHM {
            return Err(CryptoError::InvalidPayload(format!(
                "unsupported algorithm '{}'",
                self.algorithm
            )));
        }
        if self.kdf != KDF {
            return Err(CryptoError::InvalidPayload(format!(
                "unsupported kdf '{}'",
                self.kdf
            )));
        }
        Ok(())
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(value)
        .map_err(|err| CryptoError::InvalidPayload(format!("{name}: {err}")))
}

/// Seal `plain` under `key` with a fresh random IV.
pub fn encrypt(plain: &[u8], key: &DerivedKey) -> Result<EncryptedPayload, CryptoError> {
    let iv: [u8; IV_LEN] = rand::random();
    let mut sealed = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plain)
        .map_err(|_| CryptoError::Encryption)?;

    if sealed.len() < TAG_LEN {
        return Err(CryptoError::Encryption);
    }
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedPayload {
        encrypted: true,
        version: PAYLOAD_VERSION,
        algorithm: ALGORITHM.to_string(),
        kdf: KDF.to_string(),
        iterations: key.iterations,
        salt: STANDARD.encode(&key.salt),
        iv: STANDARD.encode(iv),
        auth_tag: STANDARD.encode(tag),
        ciphertext: STANDARD.encode(sealed),
    })
}

/// Open a payload. Never returns partial output: either the tag verifies and
/// the whole plaintext comes back, or the call fails.
pub fn decrypt(payload: &EncryptedPayload, key: &DerivedKey) -> Result<Vec<u8>, CryptoError> {
    payload.validate_header()?;

    let iv = decode_field("iv", &payload.iv)?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidPayload(format!(
            "iv must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    let tag = decode_field("authTag", &payload.auth_tag)?;
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidPayload(format!(
            "authTag must be {TAG_LEN} bytes, got {}",
            tag.len()
        )));
    }

    let mut sealed = decode_field("ciphertext", &payload.ciphertext)?;
    sealed.extend_from_slice(&tag);

    key.cipher()
        .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Transform hooks the engine applies around every read and write.
#[async_trait]
pub trait EncryptionHooks: Send + Sync {
    /// Whether writes will be encrypted.
    fn is_active(&self) -> bool;

    /// Produce the on-disk document for `data`. Implementations without a
    /// password return it unchanged as [`FileDocument::Plain`].
    async fn encrypt(&self, data: &NormalizedFileData) -> Result<FileDocument, CryptoError>;

    async fn decrypt(&self, payload: &EncryptedPayload) -> Result<NormalizedFileData, CryptoError>;

    /// Drop cached key material.
    fn clear(&self);
}

/// Password-based hooks with a per-session key cache.
pub struct PasswordEncryption {
    password: Mutex<Option<Zeroizing<String>>>,
    session: Mutex<Option<Arc<DerivedKey>>>,
    iterations: u32,
}

impl Default for PasswordEncryption {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordEncryption {
    pub fn new() -> Self {
        Self::with_iterations(DEFAULT_KDF_ITERATIONS)
    }

    /// Iteration count for keys derived with a fresh salt. Existing files
    /// are always opened with the count stored in their header.
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            password: Mutex::new(None),
            session: Mutex::new(None),
            iterations,
        }
    }

    pub fn set_password(&self, password: impl Into<String>) {
        *lock(&self.password) = Some(Zeroizing::new(password.into()));
        lock(&self.session).take();
    }

    pub fn has_password(&self) -> bool {
        lock(&self.password).is_some()
    }

    /// Forget the password as well as the session key.
    pub fn forget_password(&self) {
        lock(&self.password).take();
        lock(&self.session).take();
    }

    fn password(&self) -> Option<Zeroizing<String>> {
        lock(&self.password).clone()
    }

    async fn session_key(
        &self,
        password: Zeroizing<String>,
        salt: Option<Vec<u8>>,
        iterations: u32,
    ) -> Result<Arc<DerivedKey>, CryptoError> {
        if let Some(key) = lock(&self.session).as_ref() {
            let reusable = match salt.as_deref() {
                Some(salt) => key.matches(salt, iterations),
                None => true,
            };
            if reusable {
                return Ok(Arc::clone(key));
            }
        }

        let salt = salt.unwrap_or_else(|| random_salt().to_vec());
        let key = tokio::task::spawn_blocking(move || derive_key(&password, &salt, iterations))
            .await
            .map_err(|err| CryptoError::KeyDerivation(err.to_string()))??;
        tracing::debug!(iterations, "Derived session key");

        let key = Arc::new(key);
        *lock(&self.session) = Some(Arc::clone(&key));
        Ok(key)
    }
}

#[async_trait]
impl EncryptionHooks for PasswordEncryption {
    fn is_active(&self) -> bool {
        self.has_password()
    }

    async fn encrypt(&self, data: &NormalizedFileData) -> Result<FileDocument, CryptoError> {
        let Some(password) = self.password() else {
            return Ok(FileDocument::Plain(data.clone()));
        };

        let key = self.session_key(password, None, self.iterations).await?;
        let plain = Zeroizing::new(
            data.to_json_bytes()
                .map_err(|err| CryptoError::InvalidPayload(err.to_string()))?,
        );
        encrypt(&plain, &key).map(FileDocument::Encrypted)
    }

    async fn decrypt(&self, payload: &EncryptedPayload) -> Result<NormalizedFileData, CryptoError> {
        let Some(password) = self.password() else {
            self.clear();
            return Err(CryptoError::PasswordRequired);
        };

        let salt = payload.salt()?;
        let key = self
            .session_key(password, Some(salt), payload.iterations())
            .await?;

        let plain = match decrypt(payload, &key) {
            Ok(plain) => Zeroizing::new(plain),
            Err(err) => {
                if matches!(err, CryptoError::DecryptionFailed) {
                    tracing::warn!("Decryption failed; clearing cached credentials");
                    self.forget_password();
                }
                return Err(err);
            }
        };

        match FileDocument::from_slice(&plain) {
            Ok(FileDocument::Plain(data)) => Ok(data),
            Ok(FileDocument::Encrypted(_)) => Err(CryptoError::InvalidPayload(
                "nested encrypted payload".to_string(),
            )),
            Err(err) => Err(CryptoError::InvalidPayload(err.to_string())),
        }
    }

    fn clear(&self) {
        lock(&self.session).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
