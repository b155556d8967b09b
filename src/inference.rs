//! Prediction orchestration.
//!
//! A prediction is one self-contained request: the input row is typed and
//! encoded against the feature-ordering and encoder artifacts
//! ([`crate::preprocess`]), then handed to the external scorer together with
//! the model artifact location. The scorer is invoked as
//! `<interpreter> <score script> --model <path>` with a JSON request on stdin
//! and must print exactly one JSON object containing `prediction` or `error`,
//! possibly surrounded by other output. Stdout is searched first, then
//! stdout and stderr together.
//!
//! Two failure families are kept apart:
//!
//! - **Rejections** ([`PredictOutcome::Rejected`]): the request itself is
//!   unusable (unparseable date, model not trained, scorer reported `error`).
//!   These are answers, not crashes.
//! - **Errors** ([`PredictError`]): the scorer could not be run or its output
//!   could not be understood.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::{Config, RuntimeConfig};
use crate::preprocess::{build_frame, EncoderSet};
use crate::runtime::{join_streams, resolve_interpreter, run_captured, RunError};
use crate::store::ArtifactStore;

/// Result of a prediction that ran to a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictOutcome {
    Prediction {
        value: f64,
        /// Categorical fields encoded with the unknown-category fallback.
        fallback_encoded: Vec<String>,
        /// Model columns the input did not provide.
        filled_missing: Vec<String>,
    },
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("failed to launch inference routine: {0}")]
    Launch(#[source] std::io::Error),
    #[error("lost track of inference routine: {0}")]
    Wait(#[source] std::io::Error),
    #[error("inference routine timed out after {after_secs}s")]
    TimedOut { after_secs: u64, raw: String },
    #[error("inference routine produced no usable result")]
    Malformed { raw: String },
}

impl PredictError {
    /// Raw output to surface as diagnostic detail.
    pub fn details(&self) -> String {
        match self {
            PredictError::TimedOut { raw, .. } | PredictError::Malformed { raw } => raw.clone(),
            PredictError::Launch(e) | PredictError::Wait(e) => e.to_string(),
        }
    }
}

/// Feature ordering and encoders written by the training job.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifacts {
    pub features: Vec<String>,
    pub encoders: EncoderSet,
}

impl ModelArtifacts {
    pub fn load(store: &ArtifactStore) -> anyhow::Result<Self> {
        let features: Vec<String> = read_json(&store.features_path())?;
        let encoders: EncoderSet = read_json(&store.encoders_path())?;
        Ok(Self { features, encoders })
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("model artifact not available: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("model artifact is malformed: {}", path.display()))
}

/// What the scorer is expected to print.
#[derive(Debug, Deserialize)]
struct ScoreReply {
    #[serde(default)]
    prediction: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// Returns the text between the first `{` and the last `}`, inclusive.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

/// Parses the scorer's reply out of its noisy stdout.
///
/// `Some(Ok(value))` is a prediction, `Some(Err(message))` an error the
/// scorer reported, `None` output that could not be understood.
pub fn parse_reply(raw: &str) -> Option<Result<f64, String>> {
    let body = extract_json_object(raw)?;
    let reply: ScoreReply = serde_json::from_str(body).ok()?;
    match (reply.error, reply.prediction) {
        (Some(message), _) => Some(Err(message)),
        (None, Some(value)) if value.is_finite() => Some(Ok(value)),
        _ => None,
    }
}

/// Runs the external scorer for single rows.
#[derive(Debug, Clone)]
pub struct Predictor {
    store: ArtifactStore,
    runtime: RuntimeConfig,
    script: PathBuf,
    timeout: Duration,
}

impl Predictor {
    pub fn new(config: &Config, store: ArtifactStore) -> Self {
        Self {
            store,
            runtime: config.runtime.clone(),
            script: config.inference.script.clone(),
            timeout: config.inference.timeout(),
        }
    }

    pub fn command(&self) -> Command {
        let interpreter = resolve_interpreter(&self.runtime, self.store.dir());
        let mut cmd = Command::new(interpreter);
        cmd.arg(&self.script)
            .arg("--model")
            .arg(self.store.model_path())
            .current_dir(self.store.dir());
        cmd
    }

    /// Predicts one row.
    ///
    /// The model artifact is deliberately not checked here: the scorer owns
    /// that validation and reports it as an `error` reply.
    pub async fn predict(&self, input: &Map<String, Value>) -> Result<PredictOutcome, PredictError> {
        let artifacts = match ModelArtifacts::load(&self.store) {
            Ok(artifacts) => artifacts,
            Err(e) => return Ok(PredictOutcome::Rejected(format!("{:#}", e))),
        };

        let frame = match build_frame(input, &artifacts.features, &artifacts.encoders) {
            Ok(frame) => frame,
            Err(e) => return Ok(PredictOutcome::Rejected(e.to_string())),
        };
        if !frame.fallback_encoded.is_empty() {
            tracing::info!(
                fields = ?frame.fallback_encoded,
                "unknown categories encoded with fallback code"
            );
        }

        let payload = serde_json::json!({
            "columns": frame.columns,
            "values": frame.values,
            "row": input,
        })
        .to_string()
        .into_bytes();

        let captured = match run_captured(self.command(), Some(payload), self.timeout, "inference")
            .await
        {
            Ok(captured) => captured,
            Err(RunError::Launch(e)) => return Err(PredictError::Launch(e)),
            Err(RunError::Wait(e)) => return Err(PredictError::Wait(e)),
            Err(RunError::TimedOut {
                after,
                stdout,
                stderr,
            }) => {
                return Err(PredictError::TimedOut {
                    after_secs: after.as_secs(),
                    raw: join_streams(&stdout, &stderr),
                })
            }
        };

        // Scorers often report failures from an exception handler on stderr.
        let combined = captured.combined();
        let reply = parse_reply(&captured.stdout).or_else(|| parse_reply(&combined));
        match reply {
            Some(Ok(value)) => Ok(PredictOutcome::Prediction {
                value,
                fallback_encoded: frame.fallback_encoded,
                filled_missing: frame.filled_missing,
            }),
            Some(Err(message)) => Ok(PredictOutcome::Rejected(message)),
            None => {
                tracing::warn!(exit_code = ?captured.exit_code, "unparseable inference output");
                Err(PredictError::Malformed { raw: combined })
            }
        }
    }
}
