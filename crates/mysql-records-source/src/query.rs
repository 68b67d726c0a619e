//! Incremental query execution
//!
//! A query either runs verbatim every tick (snapshot) or is rewritten to
//! resume after the last delivered cursor value:
//!
//! ```text
//! Select * from dept_manager
//!   -> Select * from dept_manager where emp_no > 3 order by emp_no asc;
//! ```
//!
//! Rows whose cursor equals the checkpoint are excluded. Rows sharing the
//! boundary value are delivered together only when they are visible in the
//! same fetch; a row committed later with the same cursor value as an
//! already-advanced checkpoint is never fetched. Cursor columns are expected
//! to be unique and strictly increasing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::connection::QueryRunner;
use crate::error::{Error, Result};
use crate::record::{encode_rows, Batch, NULL_SENTINEL};

/// Type of a cursor column, deciding how its value is rendered in SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    /// Rendered as a quoted string literal
    Timestamp,
    /// Rendered unquoted; must be a decimal number
    Number,
}

impl CursorType {
    /// Cursor used on the first run when no initial value is configured.
    pub fn default_initial_value(self) -> &'static str {
        match self {
            CursorType::Timestamp => "1970-01-01 00:00:00",
            CursorType::Number => "0",
        }
    }

    /// Render `value` as a SQL literal, or explain why it cannot be.
    fn literal(self, value: &str) -> std::result::Result<String, String> {
        match self {
            CursorType::Number => {
                if is_decimal(value) {
                    Ok(value.to_string())
                } else {
                    Err(format!("'{value}' is not a NUMBER cursor value"))
                }
            }
            CursorType::Timestamp => {
                if value.contains(['\\', '\0']) {
                    Err(format!("'{value}' is not a TIMESTAMP cursor value"))
                } else {
                    Ok(format!("'{}'", value.replace('\'', "''")))
                }
            }
        }
    }
}

impl FromStr for CursorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TIMESTAMP" => Ok(CursorType::Timestamp),
            "NUMBER" => Ok(CursorType::Number),
            other => Err(Error::Config(format!(
                "unsupported cursor type '{other}', supported values are TIMESTAMP or NUMBER"
            ))),
        }
    }
}

impl fmt::Display for CursorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CursorType::Timestamp => "TIMESTAMP",
            CursorType::Number => "NUMBER",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSpec {
    pub column: String,
    pub cursor_type: CursorType,
    /// Cursor used when no checkpoint exists yet
    pub initial_value: String,
}

/// One configured query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub id: String,
    pub query: String,
    /// None for snapshot queries
    pub cursor: Option<CursorSpec>,
}

impl QuerySpec {
    /// A query re-run in full every tick.
    pub fn snapshot(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            cursor: None,
        }
    }

    /// A query resumed from its checkpoint every tick.
    pub fn incremental(
        id: impl Into<String>,
        query: impl Into<String>,
        column: impl Into<String>,
        cursor_type: CursorType,
        initial_value: Option<String>,
    ) -> Result<Self> {
        let id = id.into();
        let initial_value = initial_value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| cursor_type.default_initial_value().to_string());
        cursor_type
            .literal(&initial_value)
            .map_err(|reason| Error::Config(format!("query '{id}': initial value {reason}")))?;

        Ok(Self {
            id,
            query: query.into(),
            cursor: Some(CursorSpec {
                column: column.into(),
                cursor_type,
                initial_value,
            }),
        })
    }

    pub fn is_snapshot(&self) -> bool {
        self.cursor.is_none()
    }
}

/// Build the SQL to run for `spec` given its current checkpoint.
pub fn rewrite_query(spec: &QuerySpec, checkpoint: Option<&str>) -> Result<String> {
    let Some(cursor) = &spec.cursor else {
        return Ok(spec.query.clone());
    };

    let value = checkpoint.unwrap_or(&cursor.initial_value);
    let literal = cursor
        .cursor_type
        .literal(value)
        .map_err(|reason| Error::ResultSet {
            query_id: spec.id.clone(),
            reason: format!("checkpoint {reason}"),
        })?;

    let base = spec.query.trim_end().trim_end_matches(';').trim_end();
    let joiner = if has_where_clause(base) { "and" } else { "where" };
    Ok(format!(
        "{base} {joiner} {column} > {literal} order by {column} asc;",
        column = cursor.column
    ))
}

fn has_where_clause(query: &str) -> bool {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word.eq_ignore_ascii_case("where"))
}

fn is_decimal(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();

    !whole.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && fraction.is_none_or(|f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}

/// Runs configured queries and turns their rows into batches.
#[derive(Clone)]
pub struct QueryExecutor {
    runner: Arc<dyn QueryRunner>,
}

impl QueryExecutor {
    pub fn new(runner: Arc<dyn QueryRunner>) -> Self {
        Self { runner }
    }

    /// Fetch the rows after `checkpoint` (or all rows for snapshot queries).
    ///
    /// The candidate checkpoint is read back from the last encoded record so
    /// that what is delivered and what is checkpointed cannot disagree.
    pub async fn fetch_batch(&self, spec: &QuerySpec, checkpoint: Option<&str>) -> Result<Batch> {
        let sql = rewrite_query(spec, checkpoint)?;
        debug!(query_id = %spec.id, %sql, "Executing query");

        let result = self.runner.fetch(&spec.id, &sql).await?;

        if let Some(cursor) = &spec.cursor {
            let present = result
                .columns
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&cursor.column));
            if !present {
                return Err(Error::ResultSet {
                    query_id: spec.id.clone(),
                    reason: format!("cursor column '{}' is not in the result set", cursor.column),
                });
            }
        }

        let rows = result
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(render_value).collect())
            .collect();
        let records = encode_rows(&spec.id, &result.columns, rows, Utc::now())?;

        let next_checkpoint = match (&spec.cursor, records.last()) {
            (Some(cursor), Some(last)) => {
                let value = last.field(&cursor.column)?;
                match value {
                    Some(v) if v != NULL_SENTINEL => Some(v),
                    _ => {
                        return Err(Error::ResultSet {
                            query_id: spec.id.clone(),
                            reason: format!(
                                "last row has no value for cursor column '{}'",
                                cursor.column
                            ),
                        })
                    }
                }
            }
            _ => None,
        };

        Ok(Batch {
            query_id: spec.id.clone(),
            records,
            next_checkpoint,
        })
    }
}

fn render_value(value: Option<Vec<u8>>) -> String {
    match value {
        None => NULL_SENTINEL.to_string(),
        Some(bytes) => match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RawResultSet;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedRunner {
        result: RawResultSet,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(columns: &[&str], rows: Vec<Vec<Option<&str>>>) -> Arc<Self> {
            Arc::new(Self {
                result: RawResultSet {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    rows: rows
                        .into_iter()
                        .map(|r| r.into_iter().map(|v| v.map(|s| s.as_bytes().to_vec())).collect())
                        .collect(),
                },
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl QueryRunner for ScriptedRunner {
        async fn fetch(&self, _query_id: &str, sql: &str) -> Result<RawResultSet> {
            self.seen.lock().unwrap().push(sql.to_string());
            Ok(self.result.clone())
        }
    }

    fn dept_manager() -> QuerySpec {
        QuerySpec::incremental(
            "Q2",
            "Select * from dept_manager",
            "emp_no",
            CursorType::Number,
            Some("3".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_rewrite_number_cursor_first_run() {
        let sql = rewrite_query(&dept_manager(), None).unwrap();
        assert_eq!(
            sql,
            "Select * from dept_manager where emp_no > 3 order by emp_no asc;"
        );
    }

    #[test]
    fn test_rewrite_uses_checkpoint_over_initial_value() {
        let sql = rewrite_query(&dept_manager(), Some("7")).unwrap();
        assert_eq!(
            sql,
            "Select * from dept_manager where emp_no > 7 order by emp_no asc;"
        );
    }

    #[test]
    fn test_rewrite_appends_and_when_filtered() {
        let spec = QuerySpec::incremental(
            "audit",
            "SELECT * FROM audit WHERE kind = 'login';",
            "created_at",
            CursorType::Timestamp,
            None,
        )
        .unwrap();

        let sql = rewrite_query(&spec, Some("2024-01-01 09:30:00")).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM audit WHERE kind = 'login' and created_at > '2024-01-01 09:30:00' order by created_at asc;"
        );
    }

    #[test]
    fn test_rewrite_timestamp_default_initial_value() {
        let spec = QuerySpec::incremental(
            "audit",
            "select * from audit",
            "created_at",
            CursorType::Timestamp,
            None,
        )
        .unwrap();

        let sql = rewrite_query(&spec, None).unwrap();
        assert_eq!(
            sql,
            "select * from audit where created_at > '1970-01-01 00:00:00' order by created_at asc;"
        );
    }

    #[test]
    fn test_where_detection_is_whole_word() {
        assert!(has_where_clause("select * from t WHERE a = 1"));
        assert!(!has_where_clause("select somewhere from nowhere_table"));
    }

    #[test]
    fn test_timestamp_literal_escapes_quotes() {
        assert_eq!(
            CursorType::Timestamp.literal("it's").unwrap(),
            "'it''s'"
        );
        assert!(CursorType::Timestamp.literal("x\\").is_err());
    }

    #[test]
    fn test_number_cursor_rejects_non_numeric_checkpoint() {
        let result = rewrite_query(&dept_manager(), Some("7; drop table users"));
        assert!(matches!(result, Err(Error::ResultSet { .. })));
    }

    #[test]
    fn test_number_initial_value_validated_at_construction() {
        let result = QuerySpec::incremental(
            "Q2",
            "select * from t",
            "id",
            CursorType::Number,
            Some("abc".to_string()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_is_decimal() {
        assert!(is_decimal("0"));
        assert!(is_decimal("-12"));
        assert!(is_decimal("3.25"));
        assert!(!is_decimal(""));
        assert!(!is_decimal("1."));
        assert!(!is_decimal("1e5"));
        assert!(!is_decimal("--1"));
    }

    #[test]
    fn test_cursor_type_parse() {
        assert_eq!("timestamp".parse::<CursorType>().unwrap(), CursorType::Timestamp);
        assert_eq!("NUMBER".parse::<CursorType>().unwrap(), CursorType::Number);
        assert!(matches!("DATE".parse::<CursorType>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_snapshot_runs_verbatim() {
        let spec = QuerySpec::snapshot("Q1", "Select * from departments");
        assert!(spec.is_snapshot());
        assert_eq!(
            rewrite_query(&spec, None).unwrap(),
            "Select * from departments"
        );
    }

    #[tokio::test]
    async fn test_snapshot_batch_has_no_checkpoint() {
        let runner = ScriptedRunner::new(
            &["dept_no", "dept_name"],
            vec![
                vec![Some("d001"), Some("Marketing")],
                vec![Some("d002"), None],
            ],
        );
        let executor = QueryExecutor::new(runner.clone());

        let spec = QuerySpec::snapshot("Q1", "Select * from departments");
        let batch = executor.fetch_batch(&spec, None).await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].key, "Q1_record1");
        assert_eq!(batch.records[1].key, "Q1_record2");
        assert_eq!(
            batch.records[1].body,
            r#"{"dept_no":"d002","dept_name":"NULL"}"#
        );
        assert_eq!(batch.next_checkpoint, None);
        assert_eq!(
            runner.seen.lock().unwrap().as_slice(),
            ["Select * from departments"]
        );
    }

    #[tokio::test]
    async fn test_incremental_batch_checkpoint_is_last_cursor() {
        let runner = ScriptedRunner::new(
            &["emp_no", "dept_no"],
            vec![
                vec![Some("4"), Some("d001")],
                vec![Some("7"), Some("d002")],
            ],
        );
        let executor = QueryExecutor::new(runner.clone());

        let batch = executor.fetch_batch(&dept_manager(), None).await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.next_checkpoint, Some("7".to_string()));
        assert_eq!(batch.records[0].observed_at, batch.records[1].observed_at);
        assert_eq!(
            runner.seen.lock().unwrap()[0],
            "Select * from dept_manager where emp_no > 3 order by emp_no asc;"
        );
    }

    #[tokio::test]
    async fn test_incremental_empty_fetch() {
        let runner = ScriptedRunner::new(&["emp_no"], vec![]);
        let executor = QueryExecutor::new(runner);

        let batch = executor
            .fetch_batch(&dept_manager(), Some("7"))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.next_checkpoint, None);
    }

    #[tokio::test]
    async fn test_missing_cursor_column_is_query_error() {
        let runner = ScriptedRunner::new(&["dept_no"], vec![vec![Some("d001")]]);
        let executor = QueryExecutor::new(runner);

        let result = executor.fetch_batch(&dept_manager(), None).await;
        assert!(matches!(result, Err(Error::ResultSet { .. })));
    }
}
