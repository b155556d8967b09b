//! # Sales Forecast
//!
//! A dataset-driven forecasting service. Clients upload a CSV; the service
//! retrains a model out-of-process, reloads an in-memory view of the data,
//! and answers predictions against whatever schema the last training run
//! produced.
//!
//! ## Architecture
//!
//! ```text
//!   upload ──▶ ┌────────────────┐   ┌──────────────┐   ┌──────────────┐
//!              │ Artifact store │──▶│ Training job │──▶│ Tabular cache│
//!              │ save + cleanup │   │ (child proc) │   │ atomic swap  │
//!              └────────────────┘   └──────┬───────┘   └──────────────┘
//!                                          │ metadata, encoders,
//!                                          ▼ feature order, model
//!  predict ──▶ ┌────────────────┐   ┌──────────────┐
//!              │ Preprocessing  │──▶│ Scorer       │──▶ {prediction}
//!              │ type + encode  │   │ (child proc) │
//!              └────────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Rows, metadata document, feature descriptors |
//! | [`store`] | Artifact directory and destructive cleanup |
//! | [`schema`] | Target column resolution from metadata |
//! | [`cache`] | CSV loading and row normalization |
//! | [`runtime`] | Interpreter resolution and child process capture |
//! | [`training`] | Training job execution |
//! | [`preprocess`] | Inference feature encoding |
//! | [`inference`] | Scorer invocation and output parsing |
//! | [`service`] | The lifecycle service tying it all together |
//! | [`server`] | HTTP API |
//! | [`logging`] | `tracing` subscriber setup |

pub mod cache;
pub mod config;
pub mod inference;
pub mod logging;
pub mod models;
pub mod preprocess;
pub mod runtime;
pub mod schema;
pub mod server;
pub mod service;
pub mod store;
pub mod training;
