//! Training job execution.
//!
//! The training job is an external program invoked as
//! `<interpreter> <train script> <dataset file name>` with its working
//! directory pinned to the artifact store. On a zero exit it must have written
//! the model, feature-ordering, encoder and metadata artifacts into that
//! directory. Stdout is the user-visible training log; stderr is logged at
//! `debug` and never returned to clients.
//!
//! Reloading the tabular cache after a successful run is the caller's job
//! (see [`crate::service::Forecaster::train`]).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Config, RuntimeConfig};
use crate::runtime::{resolve_interpreter, run_captured, RunError};
use crate::store::ArtifactStore;

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("failed to launch training job: {0}")]
    Launch(#[source] std::io::Error),
    #[error("lost track of training job: {0}")]
    Wait(#[source] std::io::Error),
    #[error("training job exited with status {}", display_code(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        output: String,
    },
    #[error("training job timed out after {after_secs}s")]
    TimedOut { after_secs: u64, output: String },
}

impl TrainingError {
    /// Captured training log, when the job got far enough to produce one.
    pub fn output(&self) -> Option<&str> {
        match self {
            TrainingError::Failed { output, .. } | TrainingError::TimedOut { output, .. } => {
                Some(output)
            }
            TrainingError::Launch(_) | TrainingError::Wait(_) => None,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// A completed, successful training run.
#[derive(Debug, Clone)]
pub struct TrainingRun {
    pub run_id: Uuid,
    pub dataset: String,
    /// Stdout of the job.
    pub output: String,
    pub elapsed: Duration,
}

/// How to invoke the training job.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    store: ArtifactStore,
    runtime: RuntimeConfig,
    script: PathBuf,
    timeout: Duration,
}

impl TrainingJob {
    pub fn new(config: &Config, store: ArtifactStore) -> Self {
        Self {
            store,
            runtime: config.runtime.clone(),
            script: config.training.script.clone(),
            timeout: config.training.timeout(),
        }
    }

    /// Builds the command line. The interpreter is re-resolved on every run
    /// since a bundled interpreter may be installed while the service is up.
    pub fn command(&self, dataset: &str) -> Command {
        let interpreter = resolve_interpreter(&self.runtime, self.store.dir());
        let mut cmd = Command::new(interpreter);
        cmd.arg(&self.script)
            .arg(dataset)
            .current_dir(self.store.dir());
        cmd
    }

    /// Runs the job to completion. No retries.
    pub async fn run(&self, dataset: &str) -> Result<TrainingRun, TrainingError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("training", %run_id, dataset);
        self.run_with_id(run_id, dataset).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid, dataset: &str) -> Result<TrainingRun, TrainingError> {
        tracing::info!(script = %self.script.display(), "starting training job");
        let started = Instant::now();

        let captured = match run_captured(self.command(dataset), None, self.timeout, "training").await
        {
            Ok(captured) => captured,
            Err(RunError::Launch(e)) => {
                tracing::error!(error = %e, "training job failed to start");
                return Err(TrainingError::Launch(e));
            }
            Err(RunError::Wait(e)) => return Err(TrainingError::Wait(e)),
            Err(RunError::TimedOut { after, stdout, .. }) => {
                return Err(TrainingError::TimedOut {
                    after_secs: after.as_secs(),
                    output: stdout,
                });
            }
        };

        let elapsed = started.elapsed();
        if !captured.success {
            tracing::warn!(
                exit_code = ?captured.exit_code,
                elapsed_ms = elapsed.as_millis() as u64,
                "training job failed"
            );
            return Err(TrainingError::Failed {
                exit_code: captured.exit_code,
                output: captured.stdout,
            });
        }

        tracing::info!(
            elapsed_ms = elapsed.as_millis() as u64,
            "training job finished"
        );
        Ok(TrainingRun {
            run_id,
            dataset: dataset.to_string(),
            output: captured.stdout,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InferenceConfig, ServerConfig, StoreConfig, TrainingConfig};
    use std::fs;
    use tempfile::TempDir;

    fn config_for(tmp: &TempDir, script: &str, timeout_secs: u64) -> Config {
        fs::write(tmp.path().join("train.sh"), script).unwrap();
        Config {
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
                max_upload_bytes: 1024,
            },
            store: StoreConfig {
                dir: tmp.path().to_path_buf(),
                default_dataset: "sales_data.csv".to_string(),
                model_file: "sales_model.pkl".to_string(),
                features_file: "model_features.json".to_string(),
                encoders_file: "encoders.json".to_string(),
                metadata_file: "model_metadata.json".to_string(),
            },
            runtime: RuntimeConfig {
                bundled_interpreter: PathBuf::from("missing/python"),
                fallback_interpreter: "sh".to_string(),
            },
            training: TrainingConfig {
                script: PathBuf::from("train.sh"),
                timeout_secs,
            },
            inference: InferenceConfig::default(),
        }
    }

    fn job(config: &Config) -> TrainingJob {
        TrainingJob::new(config, ArtifactStore::new(config.store.clone()))
    }

    #[tokio::test]
    async fn test_passes_dataset_and_runs_in_store() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(
            &tmp,
            "echo \"training on $1\"\necho noise >&2\ntouch trained.marker\n",
            10,
        );
        let run = job(&config).run("B.csv").await.unwrap();
        assert_eq!(run.output, "training on B.csv\n");
        assert_eq!(run.dataset, "B.csv");
        assert!(tmp.path().join("trained.marker").exists());
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stdout() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp, "echo 'Loading data'\necho 'bad csv' >&2\nexit 2\n", 10);
        let err = job(&config).run("B.csv").await.unwrap_err();
        match &err {
            TrainingError::Failed { exit_code, output } => {
                assert_eq!(*exit_code, Some(2));
                assert_eq!(output, "Loading data\n");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(err.to_string(), "training job exited with status 2");
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_launch_failure() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_for(&tmp, "exit 0\n", 10);
        config.runtime.fallback_interpreter = "/no/such/interpreter".to_string();
        let err = job(&config).run("B.csv").await.unwrap_err();
        assert!(matches!(err, TrainingError::Launch(_)));
        assert!(err.output().is_none());
    }

    #[tokio::test]
    async fn test_stalled_job_times_out() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp, "echo started\nexec sleep 30\n", 1);
        let err = job(&config).run("B.csv").await.unwrap_err();
        match err {
            TrainingError::TimedOut { after_secs, output } => {
                assert_eq!(after_secs, 1);
                assert_eq!(output, "started\n");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
