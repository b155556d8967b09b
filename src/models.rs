//! Core data models shared by the cache, the schema resolver, and the
//! prediction pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One normalized record of the active dataset.
///
/// `date` and `sales` are always present; everything else from the source
/// line is carried through verbatim in `columns`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub date: String,
    pub sales: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marketing_spend: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holiday: Option<u8>,
    #[serde(flatten)]
    pub columns: BTreeMap<String, String>,
}

/// Describes the input a trained model expects. Written by the training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub target_column: String,
    #[serde(default)]
    pub features: Vec<FeatureDescriptor>,
}

/// Client-facing schema entry for a single model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    /// Known category values; only set for categorical features.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Categorical,
    Numeric,
    Date,
}

/// A single input field after it has been typed against the model schema.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Categorical(String),
    Numeric(f64),
    Date(NaiveDate),
}

impl FeatureValue {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureValue::Categorical(_) => FeatureKind::Categorical,
            FeatureValue::Numeric(_) => FeatureKind::Numeric,
            FeatureValue::Date(_) => FeatureKind::Date,
        }
    }
}
