//! Offline CSV to `INSERT` conversion.
//!
//! Needs no database: column types come from typed header cells such as
//! `root.sg.d1.s1(INT32)` and are otherwise inferred from the first
//! non-empty cell of each column.

use snafu::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{CsvReadSnafu, OpenInputSnafu, OutputWriteSnafu, PipelineError, TransformSnafu};
use crate::model::Record;
use crate::quote::split_last_node;
use crate::source::CsvHeader;
use crate::statement;

/// Counts of one conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformSummary {
    pub statements: u64,
    pub dropped: u64,
}

/// Write one `INSERT` line per record of the CSV read from `input`.
///
/// `source` and `target` name the two ends in errors and logs. Rows that
/// fail to parse are logged and skipped.
pub fn csv_to_inserts<R: Read, W: Write>(
    input: R,
    output: &mut W,
    source: &str,
    target: &str,
    aligned: bool,
) -> Result<TransformSummary, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);
    let mut rows = reader.records();
    let mut summary = TransformSummary::default();

    let header = match rows.next() {
        Some(row) => row.context(CsvReadSnafu { path: source }).context(TransformSnafu)?,
        None => return Ok(summary),
    };
    let mut header = CsvHeader::parse(&header, source, aligned).context(TransformSnafu)?;

    for row in rows {
        let row = row.context(CsvReadSnafu { path: source }).context(TransformSnafu)?;
        let line = row.position().map_or(0, |p| p.line());
        for record in header.records(&row, line, None) {
            match record {
                Ok(record) => {
                    output
                        .write_all(insert_line(&record).as_bytes())
                        .context(OutputWriteSnafu { path: target })?;
                    summary.statements += 1;
                }
                Err(e) => {
                    warn!(source, line, error = %e, "Dropping row");
                    summary.dropped += 1;
                }
            }
        }
    }
    output.flush().context(OutputWriteSnafu { path: target })?;
    Ok(summary)
}

/// Convert the CSV file at `input` into a statement file at `output`.
pub fn transform_file(
    input: &Path,
    output: &Path,
    aligned: bool,
) -> Result<TransformSummary, PipelineError> {
    let source = input.display().to_string();
    let target = output.display().to_string();
    let file = File::open(input)
        .context(OpenInputSnafu {
            path: source.as_str(),
        })
        .context(TransformSnafu)?;
    let out = File::create(output).context(OutputWriteSnafu {
        path: target.as_str(),
    })?;

    let summary = csv_to_inserts(
        BufReader::new(file),
        &mut BufWriter::new(out),
        &source,
        &target,
        aligned,
    )?;
    info!(
        input = %source,
        output = %target,
        statements = summary.statements,
        dropped = summary.dropped,
        "Transformation complete"
    );
    Ok(summary)
}

fn insert_line(record: &Record) -> String {
    let (columns, literals): (Vec<String>, Vec<Option<String>>) = record
        .fields
        .iter()
        .filter_map(|field| {
            let literal = field.value.to_query_literal()?;
            let measurement = split_last_node(&field.column).map_or(field.column.as_str(), |(_, m)| m);
            Some((measurement.to_string(), Some(literal)))
        })
        .unzip();
    let mut sql = statement::insert(
        &record.entity,
        &columns,
        std::iter::once((record.timestamp, literals.as_slice())),
    );
    sql.push('\n');
    sql
}
