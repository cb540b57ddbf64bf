//! On-disk document model.
//!
//! The data file holds either a plain [`NormalizedFileData`] document or an
//! [`EncryptedPayload`] wrapping one. Older exports that stored a bare array
//! of case objects are read as a normalized document with only `cases` set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::EncryptedPayload;

/// Version tag written into every normalized document.
pub const DATA_FORMAT_VERSION: &str = "2.0";

fn default_version() -> String {
    DATA_FORMAT_VERSION.to_string()
}

/// Plain application data as stored on disk.
///
/// Entity arrays are kept as raw JSON values: validating case, financial or
/// note shapes belongs to the application, not the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedFileData {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub cases: Vec<Value>,
    #[serde(default)]
    pub financials: Vec<Value>,
    #[serde(default)]
    pub notes: Vec<Value>,
    #[serde(default)]
    pub alerts: Vec<Value>,
    #[serde(default)]
    pub category_config: Value,
    #[serde(default)]
    pub activity_log: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Utc>>,
    /// Unrecognized top-level fields, preserved across a read/write cycle.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for NormalizedFileData {
    fn default() -> Self {
        Self {
            version: default_version(),
            cases: Vec::new(),
            financials: Vec::new(),
            notes: Vec::new(),
            alerts: Vec::new(),
            category_config: Value::Null,
            activity_log: Vec::new(),
            exported_at: None,
            extra: Map::new(),
        }
    }
}

impl NormalizedFileData {
    pub fn with_cases(cases: Vec<Value>) -> Self {
        Self {
            cases,
            ..Self::default()
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

/// Either shape the data file may take.
#[derive(Debug, Clone, PartialEq)]
pub enum FileDocument {
    Plain(NormalizedFileData),
    Encrypted(EncryptedPayload),
}

impl FileDocument {
    /// Parse raw file bytes, detecting the encrypted envelope by its
    /// `encrypted: true` marker.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        match value {
            Value::Array(cases) => Ok(FileDocument::Plain(NormalizedFileData::with_cases(cases))),
            Value::Object(ref map) if is_encrypted_envelope(map) => {
                serde_json::from_value(value).map(FileDocument::Encrypted)
            }
            other => serde_json::from_value(other).map(FileDocument::Plain),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            FileDocument::Plain(data) => data.to_json_bytes(),
            FileDocument::Encrypted(payload) => serde_json::to_vec_pretty(payload),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, FileDocument::Encrypted(_))
    }
}

fn is_encrypted_envelope(map: &Map<String, Value>) -> bool {
    map.get("encrypted").and_then(Value::as_bool) == Some(true) && map.contains_key("ciphertext")
}
