//! Row to record encoding.
//!
//! Each row becomes a JSON object keyed by column name, in result-set column
//! order, addressed by `<queryId>_record<ordinal>` where the ordinal is the
//! 1-based position of the row in the fetch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Value substituted for SQL NULL.
pub const NULL_SENTINEL: &str = "NULL";

/// One encoded result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// `<queryId>_record<ordinal>`
    pub key: String,
    pub query_id: String,
    /// Serialized JSON object of the row
    pub body: String,
    pub observed_at: DateTime<Utc>,
}

impl Record {
    pub fn record_key(query_id: &str, ordinal: usize) -> String {
        format!("{query_id}_record{ordinal}")
    }

    /// Log attributes attached to the record downstream.
    pub fn attributes(&self) -> [(&'static str, &str); 2] {
        [
            ("db.query_id", self.query_id.as_str()),
            ("db.record_key", self.key.as_str()),
        ]
    }

    /// Read one column back out of the encoded body.
    ///
    /// Falls back to a case-insensitive match because MySQL reports column
    /// names as written in the select list.
    pub fn field(&self, column: &str) -> Result<Option<String>> {
        let object: Map<String, Value> =
            serde_json::from_str(&self.body).map_err(|source| Error::Encoding {
                query_id: self.query_id.clone(),
                source,
            })?;

        let value = object.get(column).or_else(|| {
            object
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(column))
                .map(|(_, value)| value)
        });
        Ok(value.and_then(Value::as_str).map(str::to_string))
    }
}

/// Records produced by one query execution in one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub query_id: String,
    pub records: Vec<Record>,
    /// Cursor value of the last record, for incremental queries
    pub next_checkpoint: Option<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Encode one row. `ordinal` is 1-based.
pub fn encode_row(
    query_id: &str,
    ordinal: usize,
    columns: &[String],
    values: Vec<String>,
    observed_at: DateTime<Utc>,
) -> Result<Record> {
    if columns.len() != values.len() {
        return Err(Error::ResultSet {
            query_id: query_id.to_string(),
            reason: format!(
                "row {ordinal} has {} values for {} columns",
                values.len(),
                columns.len()
            ),
        });
    }

    let object: Map<String, Value> = columns
        .iter()
        .cloned()
        .zip(values.into_iter().map(Value::String))
        .collect();
    let body = serde_json::to_string(&object).map_err(|source| Error::Encoding {
        query_id: query_id.to_string(),
        source,
    })?;

    Ok(Record {
        key: Record::record_key(query_id, ordinal),
        query_id: query_id.to_string(),
        body,
        observed_at,
    })
}

/// Encode every row of a fetch, all stamped with the fetch time; the first
/// failure aborts the whole batch.
pub fn encode_rows(
    query_id: &str,
    columns: &[String],
    rows: Vec<Vec<String>>,
    observed_at: DateTime<Utc>,
) -> Result<Vec<Record>> {
    rows.into_iter()
        .enumerate()
        .map(|(i, values)| encode_row(query_id, i + 1, columns, values, observed_at))
        .collect()
}
