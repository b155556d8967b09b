//! Inference preprocessing.
//!
//! Turns one loosely-typed input row into the exact numeric feature vector
//! the trained model expects:
//!
//! 1. Each field is typed as a [`FeatureValue`] against the encoder set and
//!    the feature ordering (categorical if the encoder set knows it, a date
//!    if its name looks like one and it is not itself a model column,
//!    numeric if it is a model column, otherwise ignored).
//! 2. A date is decomposed into `day_of_week` (Monday = 0), `month` and
//!    `day_of_year`.
//! 3. Categorical values are label-encoded; values the encoder never saw map
//!    to code `0` instead of failing.
//! 4. The result is reindexed to the feature ordering: absent columns are
//!    `0`, extra columns are dropped.
//!
//! Fallback encodings and zero-filled columns are reported on the frame.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::models::FeatureValue;

/// Code substituted for categories unknown to the encoder.
pub const UNKNOWN_CATEGORY_CODE: usize = 0;

pub const DAY_OF_WEEK: &str = "day_of_week";
pub const MONTH: &str = "month";
pub const DAY_OF_YEAR: &str = "day_of_year";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Per-feature class lists, as fitted at training time.
///
/// A value's code is its index in the feature's class list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncoderSet {
    classes: BTreeMap<String, Vec<String>>,
}

impl EncoderSet {
    pub fn new(classes: BTreeMap<String, Vec<String>>) -> Self {
        Self { classes }
    }

    pub fn knows(&self, feature: &str) -> bool {
        self.classes.contains_key(feature)
    }

    /// Trained code for `value`, or `None` when the category is unseen.
    pub fn code(&self, feature: &str, value: &str) -> Option<usize> {
        self.classes
            .get(feature)?
            .iter()
            .position(|class| class == value)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreprocessError {
    #[error("could not parse date '{value}' in field '{field}'")]
    InvalidDate { field: String, value: String },
    #[error("field '{field}' must be numeric, got {value}")]
    InvalidNumber { field: String, value: String },
}

/// The model-ready feature vector for one input row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureFrame {
    pub columns: Vec<String>,
    pub values: Vec<f64>,
    /// Categorical fields whose value was unknown and encoded as 0.
    pub fallback_encoded: Vec<String>,
    /// Model columns absent from the input and filled with 0.
    pub filled_missing: Vec<String>,
}

impl FeatureFrame {
    pub fn get(&self, column: &str) -> Option<f64> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.values[i])
    }
}

/// Field names that are decomposed as dates at inference time.
pub fn is_date_like_field(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("date") || lower.contains("time") || lower.contains("year")
}

/// Types every usable field of `input`. Null values and fields the model
/// does not know are skipped. Only the first date-like field is kept.
pub fn type_input(
    input: &Map<String, Value>,
    features: &[String],
    encoders: &EncoderSet,
) -> Result<BTreeMap<String, FeatureValue>, PreprocessError> {
    let mut typed = BTreeMap::new();
    let mut seen_date = false;

    for (name, value) in input {
        if value.is_null() {
            continue;
        }

        if encoders.knows(name) {
            typed.insert(name.clone(), FeatureValue::Categorical(category_label(value)));
        } else if !features.contains(name) && is_date_like_field(name) {
            if seen_date {
                continue;
            }
            typed.insert(name.clone(), FeatureValue::Date(parse_date_value(name, value)?));
            seen_date = true;
        } else if features.contains(name) {
            if let Some(number) = parse_numeric_value(name, value)? {
                typed.insert(name.clone(), FeatureValue::Numeric(number));
            }
        }
    }

    Ok(typed)
}

/// Builds the feature vector for `input`. See the module docs.
pub fn build_frame(
    input: &Map<String, Value>,
    features: &[String],
    encoders: &EncoderSet,
) -> Result<FeatureFrame, PreprocessError> {
    let typed = type_input(input, features, encoders)?;

    let mut encoded: BTreeMap<String, f64> = BTreeMap::new();
    let mut fallback_encoded = Vec::new();

    for (name, value) in &typed {
        tracing::trace!(field = %name, kind = ?value.kind(), "typed input field");
        match value {
            FeatureValue::Numeric(number) => {
                encoded.insert(name.clone(), *number);
            }
            FeatureValue::Categorical(label) => {
                let code = encoders.code(name, label).unwrap_or_else(|| {
                    fallback_encoded.push(name.clone());
                    UNKNOWN_CATEGORY_CODE
                });
                encoded.insert(name.clone(), code as f64);
            }
            FeatureValue::Date(_) => {}
        }
    }

    // Derived date parts win over same-named raw fields.
    if let Some(date) = typed.values().find_map(|v| match v {
        FeatureValue::Date(d) => Some(*d),
        _ => None,
    }) {
        encoded.insert(
            DAY_OF_WEEK.to_string(),
            date.weekday().num_days_from_monday() as f64,
        );
        encoded.insert(MONTH.to_string(), date.month() as f64);
        encoded.insert(DAY_OF_YEAR.to_string(), date.ordinal() as f64);
    }

    let mut filled_missing = Vec::new();
    let values = features
        .iter()
        .map(|column| {
            encoded.get(column).copied().unwrap_or_else(|| {
                filled_missing.push(column.clone());
                0.0
            })
        })
        .collect();

    Ok(FeatureFrame {
        columns: features.to_vec(),
        values,
        fallback_encoded,
        filled_missing,
    })
}

fn category_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_numeric_value(field: &str, value: &Value) -> Result<Option<f64>, PreprocessError> {
    let invalid = || PreprocessError::InvalidNumber {
        field: field.to_string(),
        value: value.to_string(),
    };
    match value {
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(invalid),
        Value::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn parse_date_value(field: &str, value: &Value) -> Result<NaiveDate, PreprocessError> {
    let invalid = || PreprocessError::InvalidDate {
        field: field.to_string(),
        value: category_label(value),
    };
    match value {
        Value::String(s) => parse_date(s.trim()).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Parses the date formats accepted by the prediction endpoint.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoders() -> EncoderSet {
        let mut classes = BTreeMap::new();
        classes.insert(
            "region".to_string(),
            vec![
                "East".to_string(),
                "North".to_string(),
                "South".to_string(),
                "West".to_string(),
            ],
        );
        EncoderSet::new(classes)
    }

    fn features() -> Vec<String> {
        ["region", "marketing_spend", DAY_OF_WEEK, MONTH, DAY_OF_YEAR]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_decomposes_date_and_encodes_known_category() {
        let frame = build_frame(
            &row(json!({"order_date": "2025-03-01", "region": "North", "marketing_spend": "150"})),
            &features(),
            &encoders(),
        )
        .unwrap();

        assert_eq!(frame.columns, features());
        assert_eq!(frame.get("region"), Some(1.0));
        assert_eq!(frame.get("marketing_spend"), Some(150.0));
        // 2025-03-01 is a Saturday.
        assert_eq!(frame.get(DAY_OF_WEEK), Some(5.0));
        assert_eq!(frame.get(MONTH), Some(3.0));
        assert_eq!(frame.get(DAY_OF_YEAR), Some(60.0));
        assert!(frame.fallback_encoded.is_empty());
        assert!(frame.filled_missing.is_empty());
    }

    #[test]
    fn test_unknown_category_encodes_like_first_class() {
        let unknown = build_frame(
            &row(json!({"date": "2025-03-01", "region": "Atlantis"})),
            &features(),
            &encoders(),
        )
        .unwrap();
        let first = build_frame(
            &row(json!({"date": "2025-03-01", "region": "East"})),
            &features(),
            &encoders(),
        )
        .unwrap();

        assert_eq!(unknown.values, first.values);
        assert_eq!(unknown.fallback_encoded, vec!["region".to_string()]);
        assert!(first.fallback_encoded.is_empty());
    }

    #[test]
    fn test_reindex_fills_missing_and_drops_extras() {
        let frame = build_frame(
            &row(json!({"region": "West", "colour": "blue", "store_id": 7})),
            &features(),
            &encoders(),
        )
        .unwrap();
        assert_eq!(frame.values, vec![3.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(
            frame.filled_missing,
            vec![
                "marketing_spend".to_string(),
                DAY_OF_WEEK.to_string(),
                MONTH.to_string(),
                DAY_OF_YEAR.to_string()
            ]
        );
        assert!(!frame.columns.contains(&"colour".to_string()));
    }

    #[test]
    fn test_numeric_category_values_are_stringified() {
        let mut classes = BTreeMap::new();
        classes.insert("holiday".to_string(), vec!["0".to_string(), "1".to_string()]);
        let encoders = EncoderSet::new(classes);
        let features = vec!["holiday".to_string()];
        let frame = build_frame(&row(json!({"holiday": 1})), &features, &encoders).unwrap();
        assert_eq!(frame.values, vec![1.0]);
    }

    #[test]
    fn test_bad_inputs_are_domain_errors() {
        let err = build_frame(
            &row(json!({"order_date": "yesterday"})),
            &features(),
            &encoders(),
        )
        .unwrap_err();
        assert!(matches!(err, PreprocessError::InvalidDate { .. }));

        let err = build_frame(
            &row(json!({"marketing_spend": "lots"})),
            &features(),
            &encoders(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "field 'marketing_spend' must be numeric, got \"lots\""
        );
    }

    #[test]
    fn test_blank_and_null_fields_count_as_missing() {
        let frame = build_frame(
            &row(json!({"marketing_spend": "", "region": null})),
            &features(),
            &encoders(),
        )
        .unwrap();
        assert_eq!(frame.values, vec![0.0; 5]);
        assert!(frame.fallback_encoded.is_empty());
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 1);
        for raw in [
            "2025-03-01",
            "2025/03/01",
            "03/01/2025",
            "2025-03-01 08:30:00",
            "2025-03-01T08:30:00",
            "2025-03-01T08:30:00Z",
        ] {
            assert_eq!(parse_date(raw), expected, "format: {}", raw);
        }
        assert_eq!(parse_date("March 1st"), None);
    }
}
