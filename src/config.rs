//! TOML configuration parsing.
//!
//! A single file describes where the artifact store lives, which interpreter
//! runs the external training and scoring programs, and how long each of them
//! may run before being killed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

/// Layout of the artifact directory.
///
/// Every artifact name is a bare file name inside `dir`.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub dir: PathBuf,
    #[serde(default = "default_dataset")]
    pub default_dataset: String,
    #[serde(default = "default_model_file")]
    pub model_file: String,
    #[serde(default = "default_features_file")]
    pub features_file: String,
    #[serde(default = "default_encoders_file")]
    pub encoders_file: String,
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

fn default_dataset() -> String {
    "sales_data.csv".to_string()
}
fn default_model_file() -> String {
    "sales_model.pkl".to_string()
}
fn default_features_file() -> String {
    "model_features.json".to_string()
}
fn default_encoders_file() -> String {
    "encoders.json".to_string()
}
fn default_metadata_file() -> String {
    "model_metadata.json".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Interpreter shipped next to the artifacts, relative to `store.dir`.
    #[serde(default = "default_bundled_interpreter")]
    pub bundled_interpreter: PathBuf,
    /// Name resolved through `PATH` when the bundled one is absent.
    #[serde(default = "default_fallback_interpreter")]
    pub fallback_interpreter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bundled_interpreter: default_bundled_interpreter(),
            fallback_interpreter: default_fallback_interpreter(),
        }
    }
}

fn default_bundled_interpreter() -> PathBuf {
    PathBuf::from("venv/bin/python")
}
fn default_fallback_interpreter() -> String {
    "python3".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    #[serde(default = "default_train_script")]
    pub script: PathBuf,
    #[serde(default = "default_training_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            script: default_train_script(),
            timeout_secs: default_training_timeout_secs(),
        }
    }
}

impl TrainingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_train_script() -> PathBuf {
    PathBuf::from("train.py")
}
fn default_training_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_score_script")]
    pub script: PathBuf,
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            script: default_score_script(),
            timeout_secs: default_inference_timeout_secs(),
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_score_script() -> PathBuf {
    PathBuf::from("score.py")
}
fn default_inference_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.server.max_upload_bytes == 0 {
        anyhow::bail!("server.max_upload_bytes must be > 0");
    }

    if config.training.timeout_secs == 0 {
        anyhow::bail!("training.timeout_secs must be > 0");
    }
    if config.inference.timeout_secs == 0 {
        anyhow::bail!("inference.timeout_secs must be > 0");
    }

    if !config.store.default_dataset.to_ascii_lowercase().ends_with(".csv") {
        anyhow::bail!(
            "store.default_dataset must be a .csv file, got '{}'",
            config.store.default_dataset
        );
    }

    let artifacts = [
        ("store.default_dataset", &config.store.default_dataset),
        ("store.model_file", &config.store.model_file),
        ("store.features_file", &config.store.features_file),
        ("store.encoders_file", &config.store.encoders_file),
        ("store.metadata_file", &config.store.metadata_file),
    ];
    for (key, name) in artifacts {
        if !is_bare_file_name(name) {
            anyhow::bail!("{} must be a bare file name, got '{}'", key, name);
        }
    }

    Ok(())
}

/// True when `name` is a single, non-empty path component.
pub fn is_bare_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
