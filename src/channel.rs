//! Pipeline channels.
//!
//! Channels sit between a source and a sink. They rename and quote
//! identifiers, validate statements, and render typed values into the text
//! cells a file writer needs. End-of-entity markers always pass through.

use std::sync::Arc;

use crate::error::{MalformedStatementSnafu, StageError};
use crate::model::{Record, RenderedRecord, SqlLine};
use crate::pipeline::{Channel, RecordStream, RunContext};
use crate::quote::format_path;

/// Shortens full series names to quoted measurement names.
///
/// `root.sg.d1.s1` on entity `root.sg.d1` becomes `s1`; names outside the
/// entity are only quoted.
pub struct MeasurementChannel;

impl MeasurementChannel {
    fn measurement(entity: &str, column: &str) -> String {
        let short = column
            .strip_prefix(entity)
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(column);
        format_path(short)
    }
}

impl Channel for MeasurementChannel {
    type Input = Record;
    type Output = Record;

    fn name(&self) -> &'static str {
        "measurement"
    }

    fn transform(self: Arc<Self>, input: RecordStream<Record>, _ctx: &RunContext) -> RecordStream<Record> {
        Box::new(input.map(|item| {
            item.map(|mut record| {
                let entity = record.entity.name().to_string();
                for field in &mut record.fields {
                    field.column = Self::measurement(&entity, &field.column);
                }
                record
            })
        }))
    }
}

/// Re-quotes the target and columns of `INSERT` lines.
///
/// Other statements pass through unchanged. A leading `timestamp` or `time`
/// column keeps its spelling, since it names the time column rather than a
/// series.
pub struct StatementChannel;

const INSERT_PREFIX: &str = "INSERT INTO";

/// Byte offset of the first `target` outside backtick or double-quote spans.
fn find_unquoted(text: &str, target: char) -> Option<usize> {
    let mut active: Option<char> = None;
    for (i, c) in text.char_indices() {
        match active {
            Some(open) if c == open => active = None,
            Some(_) => {}
            None if c == '`' || c == '"' => active = Some(c),
            None if c == target => return Some(i),
            None => {}
        }
    }
    None
}

impl StatementChannel {
    pub fn requote(statement: &str) -> Result<String, StageError> {
        let malformed = || {
            MalformedStatementSnafu {
                statement: statement.to_string(),
            }
            .build()
        };
        let is_insert = statement
            .get(..INSERT_PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(INSERT_PREFIX));
        if !is_insert {
            return Ok(statement.to_string());
        }

        let body = &statement[INSERT_PREFIX.len()..];
        let open = find_unquoted(body, '(').ok_or_else(malformed)?;
        let path = body[..open].trim();
        let after_open = &body[open + 1..];
        let close = find_unquoted(after_open, ')').ok_or_else(malformed)?;
        let columns = &after_open[..close];
        let rest = &after_open[close + 1..];
        if path.is_empty() || columns.trim().is_empty() {
            return Err(malformed());
        }

        let columns = match find_unquoted(columns, ',') {
            Some(comma) if is_time_column(&columns[..comma]) => format!(
                "{},{}",
                columns[..comma].trim(),
                format_path(&columns[comma + 1..])
            ),
            None if is_time_column(columns) => columns.trim().to_string(),
            _ => format_path(columns),
        };
        Ok(format!(
            "{INSERT_PREFIX} {}({columns}){rest}",
            format_path(path)
        ))
    }
}

fn is_time_column(column: &str) -> bool {
    let column = column.trim();
    column.eq_ignore_ascii_case("timestamp") || column.eq_ignore_ascii_case("time")
}

impl Channel for StatementChannel {
    type Input = SqlLine;
    type Output = SqlLine;

    fn name(&self) -> &'static str {
        "statement"
    }

    fn transform(self: Arc<Self>, input: RecordStream<SqlLine>, _ctx: &RunContext) -> RecordStream<SqlLine> {
        Box::new(input.map(|item| {
            let line = item?;
            if line.entity.is_end_marker() {
                return Ok(line);
            }
            let statement = Self::requote(&line.statement)?;
            Ok(SqlLine {
                entity: line.entity,
                statement,
            })
        }))
    }
}

/// Target text form of [`RenderChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStyle {
    /// CSV cells: null is an empty cell, text is double-quoted.
    Csv,
    /// Query literals for `INSERT` statements.
    Query,
}

/// Renders typed records into text cells.
pub struct RenderChannel {
    style: RenderStyle,
    include_nulls: bool,
}

impl RenderChannel {
    pub fn csv() -> Self {
        Self {
            style: RenderStyle::Csv,
            include_nulls: true,
        }
    }

    /// Query literals; null cells are dropped unless `include_nulls`.
    pub fn query(include_nulls: bool) -> Self {
        Self {
            style: RenderStyle::Query,
            include_nulls,
        }
    }

    fn render(&self, record: Record) -> RenderedRecord {
        if record.entity.is_end_marker() {
            return RenderedRecord::end_of_entity(&record.entity);
        }
        let mut columns = Vec::with_capacity(record.fields.len());
        let mut cells = Vec::with_capacity(record.fields.len());
        for field in record.fields {
            let cell = match self.style {
                RenderStyle::Csv => (!field.value.is_null()).then(|| field.value.to_csv_cell()),
                RenderStyle::Query => field.value.to_query_literal(),
            };
            if cell.is_none() && !self.include_nulls {
                continue;
            }
            columns.push(field.column);
            cells.push(cell);
        }
        RenderedRecord {
            entity: record.entity,
            timestamp: record.timestamp,
            columns,
            cells,
        }
    }
}

impl Channel for RenderChannel {
    type Input = Record;
    type Output = RenderedRecord;

    fn name(&self) -> &'static str {
        match self.style {
            RenderStyle::Csv => "render_csv",
            RenderStyle::Query => "render_query",
        }
    }

    fn transform(
        self: Arc<Self>,
        input: RecordStream<Record>,
        _ctx: &RunContext,
    ) -> RecordStream<RenderedRecord> {
        Box::new(input.map(move |item| item.map(|record| self.render(record))))
    }
}
