//! Schema resolution from the persisted metadata document.
//!
//! The target column is not fixed across uploads (one CSV calls it `revenue`,
//! another `units`); the training job decides and records it, and ingestion
//! follows that record.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use crate::models::MetadataDocument;

/// Target column assumed when no model has been trained yet.
pub const FALLBACK_TARGET: &str = "sales";

/// Reads the metadata document verbatim. `Ok(None)` means "not trained yet".
pub fn load_metadata_raw(path: &Path) -> Result<Option<Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read metadata: {}", path.display()))
        }
    };
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Malformed metadata document: {}", path.display()))?;
    Ok(Some(value))
}

/// Reads and types the metadata document.
pub fn load_metadata(path: &Path) -> Result<Option<MetadataDocument>> {
    match load_metadata_raw(path)? {
        Some(value) => {
            let doc = serde_json::from_value(value)
                .with_context(|| format!("Unexpected metadata shape: {}", path.display()))?;
            Ok(Some(doc))
        }
        None => Ok(None),
    }
}

/// Returns the declared target column, or [`FALLBACK_TARGET`] when the
/// document is absent, unreadable, or declares no target.
///
/// Only `target_column` is read; the feature list may use types this
/// service does not model.
pub fn resolve_target(path: &Path) -> String {
    let value = match load_metadata_raw(path) {
        Ok(Some(value)) => value,
        Ok(None) => return FALLBACK_TARGET.to_string(),
        Err(e) => {
            tracing::warn!(
                error = %format!("{:#}", e),
                "ignoring unreadable metadata, using fallback target"
            );
            return FALLBACK_TARGET.to_string();
        }
    };

    match value.get("target_column").and_then(Value::as_str).map(str::trim) {
        Some(target) if !target.is_empty() => target.to_string(),
        _ => {
            tracing::warn!(
                path = %path.display(),
                "metadata declares no target column, using fallback"
            );
            FALLBACK_TARGET.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_metadata_falls_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model_metadata.json");
        assert!(load_metadata(&path).unwrap().is_none());
        assert_eq!(resolve_target(&path), "sales");
    }

    #[test]
    fn test_declared_target_wins() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model_metadata.json");
        std::fs::write(&path, r#"{"target_column": "revenue", "features": []}"#).unwrap();
        assert_eq!(resolve_target(&path), "revenue");
    }

    #[test]
    fn test_corrupt_metadata_falls_back_but_raw_load_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model_metadata.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(resolve_target(&path), "sales");
        assert!(load_metadata_raw(&path).is_err());
    }

    #[test]
    fn test_unknown_feature_type_keeps_declared_target() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model_metadata.json");
        std::fs::write(
            &path,
            r#"{"target_column": "revenue", "features": [{"name": "ts", "type": "datetime"}]}"#,
        )
        .unwrap();
        assert!(load_metadata(&path).is_err());
        assert_eq!(resolve_target(&path), "revenue");
    }

    #[test]
    fn test_blank_or_missing_target_falls_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model_metadata.json");
        std::fs::write(&path, r#"{"target_column": "  ", "features": []}"#).unwrap();
        assert_eq!(resolve_target(&path), "sales");
        std::fs::write(&path, r#"{"features": []}"#).unwrap();
        assert_eq!(resolve_target(&path), "sales");
    }
}
