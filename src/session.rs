//! The database collaborator.
//!
//! The pipeline never talks to a database directly. It issues query text
//! through a [`Session`] and reads results through a [`RowIterator`].
//! Implementations are blocking; stages call them from blocking worker
//! threads.

use crate::error::SessionError;
use crate::model::FieldValue;

/// Name of the leading time column in query results.
pub const TIME_COLUMN: &str = "Time";

/// A connection able to run queries and statements.
pub trait Session: Send + Sync {
    /// Run a query and stream its rows.
    fn execute_query(&self, sql: &str) -> Result<Box<dyn RowIterator>, SessionError>;

    /// Run a statement that produces no rows.
    fn execute_statement(&self, sql: &str) -> Result<(), SessionError>;
}

/// Rows of one query result.
///
/// When the first column is [`TIME_COLUMN`], each row carries a timestamp
/// and `values` align with the remaining columns. Otherwise `values` align
/// with every column.
pub trait RowIterator: Iterator<Item = Result<Row, SessionError>> + Send {
    fn column_names(&self) -> &[String];
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp: Option<i64>,
    pub values: Vec<FieldValue>,
}

impl Row {
    /// Value of `name` given the result's column names. Names match
    /// case-insensitively, since servers differ in header casing.
    pub fn get<'a>(&'a self, columns: &[String], name: &str) -> Option<&'a FieldValue> {
        let offset = usize::from(self.timestamp.is_some());
        let index = columns.iter().position(|c| c.eq_ignore_ascii_case(name))?;
        self.values.get(index.checked_sub(offset)?)
    }

    /// Text rendering of `name`, empty for null or missing values.
    pub fn text(&self, columns: &[String], name: &str) -> String {
        match self.get(columns, name) {
            Some(FieldValue::Null) | None => String::new(),
            Some(value) => value.to_string(),
        }
    }

    /// Text of the first of `names` present in the result.
    pub fn text_any(&self, columns: &[String], names: &[&str]) -> String {
        names
            .iter()
            .find(|name| columns.iter().any(|c| c.eq_ignore_ascii_case(name)))
            .map(|name| self.text(columns, name))
            .unwrap_or_default()
    }
}

/// A materialized result, useful for sessions that buffer their answers.
#[derive(Debug)]
pub struct RowSet {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Row>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl Iterator for RowSet {
    type Item = Result<Row, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(Ok)
    }
}

impl RowIterator for RowSet {
    fn column_names(&self) -> &[String] {
        &self.columns
    }
}
