//! The dataset and model lifecycle service.
//!
//! [`Forecaster`] owns every piece of process-wide state: the active dataset
//! reference, the tabular cache, and the artifact store. Two guarantees hold:
//!
//! - **Single flight.** At most one upload/training run is in progress; a
//!   second request is rejected with [`ServiceError::Busy`] rather than
//!   queued. The guard covers the whole critical section (save, cleanup,
//!   train, reload), so no run can delete another run's artifacts.
//! - **Atomic reload.** The cache is an `Arc<TableSnapshot>` swapped in one
//!   write. Readers observe the old table or the new one, never a mix, and a
//!   failed run leaves the old snapshot untouched.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::cache::{load_rows, TableSnapshot};
use crate::config::Config;
use crate::inference::{PredictError, PredictOutcome, Predictor};
use crate::schema;
use crate::store::{dataset_digest, sanitize_upload_name, ArtifactStore, CleanupReport};
use crate::training::{TrainingError, TrainingJob};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("a training run is already in progress")]
    Busy,
    #[error("failed to store dataset: {0:#}")]
    Storage(anyhow::Error),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error("failed to reload dataset: {0:#}")]
    Reload(anyhow::Error),
}

/// Outcome of a successful training run, after the cache was reloaded.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub run_id: Uuid,
    pub dataset: String,
    /// Stdout of the training job.
    pub output: String,
    pub elapsed: Duration,
    pub rows_loaded: usize,
    pub rows_dropped: usize,
}

/// Everything a successful upload did.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub sha256: String,
    pub cleanup: CleanupReport,
    pub training: TrainingSummary,
}

/// Point-in-time view of the service.
///
/// `dataset` is the active upload; `loaded_dataset` is the file the cached
/// rows came from. They differ after a failed training run, since the cache
/// keeps the previous table. `target_column`, `rows`, `rows_dropped` and
/// `loaded_at` all describe `loaded_dataset`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub dataset: Option<String>,
    pub loaded_dataset: Option<String>,
    pub target_column: Option<String>,
    pub rows: usize,
    pub rows_dropped: usize,
    pub loaded_at: Option<DateTime<Utc>>,
    pub model_trained: bool,
    pub training_in_progress: bool,
}

pub struct Forecaster {
    store: ArtifactStore,
    training_job: TrainingJob,
    predictor: Predictor,
    active: RwLock<Option<String>>,
    cache: RwLock<Arc<TableSnapshot>>,
    training: Mutex<()>,
}

impl Forecaster {
    /// Builds the service with an empty cache.
    ///
    /// The artifact directory is created if needed and made absolute, since
    /// child processes run with it as their working directory.
    pub fn new(config: &Config) -> Result<Self> {
        let mut layout = config.store.clone();
        std::fs::create_dir_all(&layout.dir).with_context(|| {
            format!("Failed to create artifact directory: {}", layout.dir.display())
        })?;
        layout.dir = std::fs::canonicalize(&layout.dir)
            .with_context(|| format!("Failed to resolve {}", layout.dir.display()))?;

        let store = ArtifactStore::new(layout);
        Ok(Self {
            training_job: TrainingJob::new(config, store.clone()),
            predictor: Predictor::new(config, store.clone()),
            store,
            active: RwLock::new(None),
            cache: RwLock::new(Arc::new(TableSnapshot::empty())),
            training: Mutex::new(()),
        })
    }

    /// Builds the service and loads whatever dataset a previous process left
    /// in the store. A dataset that fails to load leaves the cache empty.
    pub async fn open(config: &Config) -> Result<Self> {
        let service = Self::new(config)?;
        if let Some(dataset) = service.store.discover_active_dataset() {
            tracing::info!(dataset = %dataset, "found active dataset");
            *service.active.write().await = Some(dataset.clone());
            if let Err(e) = service.reload_from(&dataset).await {
                tracing::warn!(error = %format!("{:#}", e), "initial cache load failed");
            }
        }
        Ok(service)
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Current cache snapshot.
    pub async fn snapshot(&self) -> Arc<TableSnapshot> {
        self.cache.read().await.clone()
    }

    pub async fn active_dataset(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// The metadata document exactly as the training job wrote it.
    pub fn metadata(&self) -> Result<Option<Value>> {
        schema::load_metadata_raw(&self.store.metadata_path())
    }

    pub fn is_training(&self) -> bool {
        self.training.try_lock().is_err()
    }

    pub async fn status(&self) -> ServiceStatus {
        let snapshot = self.snapshot().await;
        ServiceStatus {
            dataset: self.active_dataset().await,
            loaded_dataset: snapshot.dataset.clone(),
            target_column: snapshot.target.clone(),
            rows: snapshot.rows.len(),
            rows_dropped: snapshot.dropped,
            loaded_at: snapshot.loaded_at,
            model_trained: self.store.has_model(),
            training_in_progress: self.is_training(),
        }
    }

    /// Rebuilds the cache from the active dataset.
    pub async fn reload(&self) -> Result<Arc<TableSnapshot>> {
        let dataset = self
            .active_dataset()
            .await
            .ok_or_else(|| anyhow::anyhow!("no dataset has been uploaded"))?;
        self.reload_from(&dataset).await
    }

    async fn reload_from(&self, dataset: &str) -> Result<Arc<TableSnapshot>> {
        let target = schema::resolve_target(&self.store.metadata_path());
        let path = self.store.path_of(dataset);
        let table = {
            let target = target.clone();
            tokio::task::spawn_blocking(move || load_rows(&path, &target)).await??
        };

        tracing::info!(
            dataset,
            target = %target,
            rows = table.rows.len(),
            dropped = table.dropped,
            "tabular cache reloaded"
        );
        let snapshot = Arc::new(TableSnapshot::from_table(dataset.to_string(), target, table));
        *self.cache.write().await = snapshot.clone();
        Ok(snapshot)
    }

    /// Runs the training job on `dataset` and reloads the cache on success.
    pub async fn train(&self, dataset: &str) -> Result<TrainingSummary, ServiceError> {
        let _guard = self.training.try_lock().map_err(|_| ServiceError::Busy)?;
        self.train_locked(dataset).await
    }

    async fn train_locked(&self, dataset: &str) -> Result<TrainingSummary, ServiceError> {
        let run = self.training_job.run(dataset).await?;
        let snapshot = self
            .reload_from(dataset)
            .await
            .map_err(ServiceError::Reload)?;
        Ok(TrainingSummary {
            run_id: run.run_id,
            dataset: run.dataset,
            output: run.output,
            elapsed: run.elapsed,
            rows_loaded: snapshot.rows.len(),
            rows_dropped: snapshot.dropped,
        })
    }

    /// Accepts a new dataset: saves it, destroys every prior dataset and
    /// model artifact, then trains synchronously.
    ///
    /// The cleanup is unconditional. If training then fails, the previous
    /// model is gone and the cache still shows the previous dataset.
    pub async fn upload(&self, file_name: &str, bytes: &[u8]) -> Result<UploadReceipt, ServiceError> {
        let name = sanitize_upload_name(file_name).ok_or_else(|| {
            ServiceError::BadRequest(format!(
                "Invalid dataset file name '{}': expected a .csv file",
                file_name
            ))
        })?;
        if bytes.is_empty() {
            return Err(ServiceError::BadRequest("Uploaded file is empty".to_string()));
        }

        let _guard = self.training.try_lock().map_err(|_| ServiceError::Busy)?;

        self.store
            .write_dataset(&name, bytes)
            .map_err(ServiceError::Storage)?;
        let cleanup = self.store.clear_for_upload(&name);
        if !cleanup.failed.is_empty() {
            tracing::warn!(failed = cleanup.failed.len(), "some stale artifacts were not removed");
        }
        *self.active.write().await = Some(name.clone());

        let sha256 = dataset_digest(bytes);
        tracing::info!(dataset = %name, %sha256, removed = cleanup.removed.len(), "dataset accepted");

        let training = self.train_locked(&name).await?;
        Ok(UploadReceipt {
            sha256,
            cleanup,
            training,
        })
    }

    pub async fn predict(&self, input: &Map<String, Value>) -> Result<PredictOutcome, PredictError> {
        self.predictor.predict(input).await
    }
}
