//! Autosave configuration.
//!
//! Layered loading, lowest precedence first:
//! 1. Defaults (from code)
//! 2. Config file (`casekeep.toml`)
//! 3. Environment variables (`CASEKEEP_*` prefix)

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default on-disk document name inside the connected folder.
pub const DEFAULT_DATA_FILE_NAME: &str = "case-tracker-data.json";

/// Lowest PBKDF2 iteration count accepted from configuration.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutosaveConfig {
    /// Enable debounced and periodic background writes. Manual saves work
    /// either way.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval of the forced periodic save.
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,

    /// Quiet period after the last change before a debounced write fires.
    #[serde(default = "default_debounce_delay_ms")]
    pub debounce_delay_ms: u64,

    /// Total write attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Data document name inside the connected folder.
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// PBKDF2-SHA256 iterations for newly encrypted files.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_true() -> bool {
    true
}
fn default_save_interval_ms() -> u64 {
    120_000
}
fn default_debounce_delay_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_ms() -> u64 {
    10_000
}
fn default_file_name() -> String {
    DEFAULT_DATA_FILE_NAME.to_string()
}
fn default_kdf_iterations() -> u32 {
    crate::crypto::DEFAULT_KDF_ITERATIONS
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            save_interval_ms: default_save_interval_ms(),
            debounce_delay_ms: default_debounce_delay_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            file_name: default_file_name(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

impl AutosaveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.save_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "save_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.debounce_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "debounce_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry_max_delay_ms ({}) is below retry_base_delay_ms ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            )));
        }
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(ConfigError::ValidationError(format!(
                "kdf_iterations must be at least {MIN_KDF_ITERATIONS}"
            )));
        }
        validate_file_name(&self.file_name)
            .map_err(|reason| ConfigError::ValidationError(format!("file_name: {reason}")))
    }

    /// Apply a partial update, validating the result before committing it.
    pub fn apply(&mut self, update: &AutosaveConfigUpdate) -> Result<(), ConfigError> {
        let mut next = self.clone();
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(interval) = update.save_interval_ms {
            next.save_interval_ms = interval;
        }
        if let Some(delay) = update.debounce_delay_ms {
            next.debounce_delay_ms = delay;
        }
        if let Some(max_retries) = update.max_retries {
            next.max_retries = max_retries;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Partial update accepted by `AutosaveEngine::update_config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutosaveConfigUpdate {
    pub enabled: Option<bool>,
    pub save_interval_ms: Option<u64>,
    pub debounce_delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

/// Names usable as sibling data documents: a bare `*.json` file name.
pub fn validate_file_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(format!("'{name}' must not contain path components"));
    }
    if !name.to_ascii_lowercase().ends_with(".json") {
        return Err(format!("'{name}' is not a .json file"));
    }
    Ok(())
}

/// Configuration loader with layered merging support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (CASEKEEP_ prefix)
    pub fn load(&self) -> Result<AutosaveConfig, ConfigError> {
        let mut builder = Config::builder();

        let defaults_json = serde_json::to_string(&AutosaveConfig::default())?;
        builder = builder.add_source(File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(ref path) = self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        // Example: CASEKEEP_DEBOUNCE_DELAY_MS=2000
        builder = builder.add_source(
            Environment::with_prefix("CASEKEEP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AutosaveConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Locate the default config file:
    /// 1. Current directory: ./casekeep.toml
    /// 2. XDG config: ~/.config/casekeep/config.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./casekeep.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        dirs::config_dir()
            .map(|dir| dir.join("casekeep").join("config.toml"))
            .filter(|path| path.exists())
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<AutosaveConfig, ConfigError> {
        match Self::find_config_file() {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::new().load(),
        }
    }
}
