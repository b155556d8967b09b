//! Tabular cache loading.
//!
//! Parses the active dataset into normalized [`Row`]s. Rows without a
//! resolvable date or a numeric target are filtered out; the number filtered
//! is reported so silent data loss stays visible to callers and tests.
//!
//! # Normalization
//!
//! 1. If there is no `date` column, the first column whose lowercase name
//!    contains `date` or `time` is aliased into `date`.
//! 2. The resolved target column is parsed into `sales`; a literal `sales`
//!    column is used only when the target column is absent.
//! 3. `marketing_spend` and `holiday` are parsed when present.
//! 4. The row is kept iff `date` is non-empty and `sales` is finite.
//!
//! Source order is preserved.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use crate::models::Row;

const DATE_KEY: &str = "date";
const SALES_KEY: &str = "sales";
const SPEND_KEY: &str = "marketing_spend";
const HOLIDAY_KEY: &str = "holiday";

/// Result of parsing one dataset file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedTable {
    pub rows: Vec<Row>,
    pub dropped: usize,
}

/// An immutable, fully-built view of the active dataset.
///
/// Readers hold an `Arc` to one of these; a reload builds a new snapshot and
/// swaps it in, so a partially loaded table is never observable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSnapshot {
    pub dataset: Option<String>,
    pub target: Option<String>,
    pub rows: Vec<Row>,
    pub dropped: usize,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl TableSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_table(dataset: String, target: String, table: LoadedTable) -> Self {
        Self {
            dataset: Some(dataset),
            target: Some(target),
            rows: table.rows,
            dropped: table.dropped,
            loaded_at: Some(Utc::now()),
        }
    }
}

/// Loads and normalizes every row of the CSV at `path`.
pub fn load_rows(path: &Path, target: &str) -> Result<LoadedTable> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open dataset: {}", path.display()))?;
    parse_rows(file, target).with_context(|| format!("Failed to parse dataset: {}", path.display()))
}

/// Parses CSV text from any reader. See the module docs for the rules.
pub fn parse_rows<R: Read>(reader: R, target: &str) -> Result<LoadedTable> {
    let mut csv = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = csv
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut table = LoadedTable::default();
    for record in csv.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable CSV record");
                table.dropped += 1;
                continue;
            }
        };

        let fields: Vec<(&str, &str)> = headers
            .iter()
            .map(|h| h.as_str())
            .zip(record.iter())
            .collect();

        match normalize_record(&fields, target) {
            Some(row) => table.rows.push(row),
            None => table.dropped += 1,
        }
    }

    Ok(table)
}

/// Normalizes one `(column, value)` record, in source column order.
///
/// Returns `None` when the record must be dropped.
pub fn normalize_record(fields: &[(&str, &str)], target: &str) -> Option<Row> {
    let lookup = |key: &str| fields.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

    let date = lookup(DATE_KEY)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            fields
                .iter()
                .filter(|(k, v)| *k != DATE_KEY && is_date_like_column(k) && !v.is_empty())
                .map(|(_, v)| *v)
                .next()
        })?
        .to_string();

    let sales = match lookup(target) {
        Some(raw) => parse_number(raw),
        None => lookup(SALES_KEY).and_then(parse_number),
    }?;

    let marketing_spend = lookup(SPEND_KEY).and_then(parse_number);
    let holiday = lookup(HOLIDAY_KEY)
        .and_then(parse_number)
        .map(|v| u8::from(v != 0.0));

    let columns: BTreeMap<String, String> = fields
        .iter()
        .filter(|(k, _)| !matches!(*k, DATE_KEY | SALES_KEY | SPEND_KEY | HOLIDAY_KEY))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Some(Row {
        date,
        sales,
        marketing_spend,
        holiday,
        columns,
    })
}

/// Column names treated as dates during ingestion.
pub fn is_date_like_column(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("date") || lower.contains("time")
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
