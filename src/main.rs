//! # Forecast CLI (`forecast`)
//!
//! ## Usage
//!
//! ```bash
//! forecast --config ./config/forecast.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `forecast serve` | Start the HTTP server |
//! | `forecast upload <csv>` | Replace the active dataset and retrain |
//! | `forecast predict '<json>'` | Predict one row |
//! | `forecast metadata` | Print the trained model's metadata document |
//! | `forecast status` | Show the active dataset and model state |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sales_forecast::config::load_config;
use sales_forecast::inference::PredictOutcome;
use sales_forecast::logging::init_tracing;
use sales_forecast::schema;
use sales_forecast::server;
use sales_forecast::service::Forecaster;

/// Forecast: upload a dataset, retrain out-of-process, serve predictions.
#[derive(Parser)]
#[command(
    name = "forecast",
    about = "Dataset-driven forecasting service",
    version,
    long_about = "Keeps one active CSV dataset and the model trained from it. Uploading a new \
    dataset destroys the previous one with all of its artifacts, runs the external training job, \
    and reloads the in-memory table. Predictions are scored by an external routine."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/forecast.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve,

    /// Replace the active dataset with a local CSV file and retrain.
    ///
    /// Every previous dataset and model artifact is deleted before training
    /// starts, whether or not training then succeeds.
    Upload {
        /// Path to the CSV file.
        path: PathBuf,
    },

    /// Predict one row given as a JSON object.
    Predict {
        /// Input row, e.g. '{"date": "2025-03-01", "region": "North"}'.
        input: String,
    },

    /// Print the metadata document of the trained model.
    Metadata,

    /// Show the active dataset, cached row counts, and model state.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&config).await?;
        }
        Commands::Upload { path } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let forecaster = Forecaster::new(&config)?;
            match forecaster.upload(&file_name, &bytes).await {
                Ok(receipt) => {
                    print!("{}", receipt.training.output);
                    println!("dataset: {}", receipt.training.dataset);
                    println!("sha256: {}", receipt.sha256);
                    println!("removed artifacts: {}", receipt.cleanup.removed.len());
                    println!(
                        "rows loaded: {} (dropped: {})",
                        receipt.training.rows_loaded, receipt.training.rows_dropped
                    );
                    println!("ok");
                }
                Err(e) => {
                    if let sales_forecast::service::ServiceError::Training(ref te) = e {
                        if let Some(output) = te.output() {
                            eprint!("{}", output);
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        Commands::Predict { input } => {
            let value: serde_json::Value =
                serde_json::from_str(&input).context("Input must be valid JSON")?;
            let row = value
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("Input must be a JSON object"))?;

            let forecaster = Forecaster::new(&config)?;
            match forecaster.predict(row).await {
                Ok(PredictOutcome::Prediction {
                    value,
                    fallback_encoded,
                    filled_missing,
                }) => {
                    println!("prediction: {}", value);
                    if !fallback_encoded.is_empty() {
                        println!("unknown categories: {}", fallback_encoded.join(", "));
                    }
                    if !filled_missing.is_empty() {
                        println!("filled with 0: {}", filled_missing.join(", "));
                    }
                }
                Ok(PredictOutcome::Rejected(message)) => {
                    anyhow::bail!("prediction refused: {}", message);
                }
                Err(e) => {
                    eprintln!("{}", e.details());
                    return Err(e.into());
                }
            }
        }
        Commands::Metadata => {
            let forecaster = Forecaster::new(&config)?;
            match schema::load_metadata(&forecaster.store().metadata_path()) {
                Ok(Some(doc)) => {
                    println!("target column: {}", doc.target_column);
                    for feature in &doc.features {
                        match &feature.options {
                            Some(options) => println!(
                                "  {} ({:?}): {}",
                                feature.name,
                                feature.kind,
                                options.join(", ")
                            ),
                            None => println!("  {} ({:?})", feature.name, feature.kind),
                        }
                    }
                }
                Ok(None) => anyhow::bail!("No trained model: metadata document not found"),
                // Feature types this build does not model: show the document as written.
                Err(_) => match forecaster.metadata()? {
                    Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                    None => anyhow::bail!("No trained model: metadata document not found"),
                },
            }
        }
        Commands::Status => {
            let forecaster = Forecaster::open(&config).await?;
            let status = forecaster.status().await;
            println!("dataset: {}", status.dataset.as_deref().unwrap_or("(none)"));
            if status.loaded_dataset != status.dataset {
                println!(
                    "cached rows from: {} (last training run failed)",
                    status.loaded_dataset.as_deref().unwrap_or("(none)")
                );
            }
            println!(
                "target column: {}",
                status.target_column.as_deref().unwrap_or("(none)")
            );
            println!("rows: {} (dropped: {})", status.rows, status.rows_dropped);
            println!("model trained: {}", status.model_trained);
        }
    }

    Ok(())
}
