//! Delimited-text export, plain or compressed.

use snafu::prelude::*;
use std::io::{BufWriter, Write};

use crate::codec::{CompressWriter, Compression};
use crate::config::RunConfig;
use crate::error::{CloseResourceSnafu, CsvWriteSnafu, SinkError, WriteResourceSnafu};
use crate::model::{EntityDescriptor, RenderedRecord};
use crate::pipeline::RunContext;
use crate::session::TIME_COLUMN;

use super::file::FileLayout;
use super::router::{EntityResource, ResourceFactory};
use super::csv_text;

/// Opens one CSV file per entity.
pub struct CsvFileFactory {
    layout: FileLayout,
    compression: Option<Compression>,
}

impl CsvFileFactory {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            layout: FileLayout::new(config),
            compression: config.format.compression(),
        }
    }
}

impl ResourceFactory for CsvFileFactory {
    type Item = RenderedRecord;
    type Resource = CsvEntityWriter;

    fn open(
        &mut self,
        entity: &EntityDescriptor,
        ctx: &RunContext,
    ) -> Result<CsvEntityWriter, SinkError> {
        let opened = self.layout.open(entity.name(), ctx)?;
        let writer = BufWriter::new(opened.file);
        let out: Box<dyn CompressWriter> = match self.compression {
            Some(codec) => codec.encoder(writer),
            None => Box::new(writer),
        };
        Ok(CsvEntityWriter {
            entity: entity.name().to_string(),
            out,
            header: None,
            header_written: opened.reopened,
        })
    }

    fn finish(&mut self, _ctx: &RunContext) -> Result<(), SinkError> {
        self.layout.finish()
    }
}

/// CSV output of one entity.
///
/// The header is `Time` followed by full series paths, taken from the first
/// record written. Later records are laid out by column name.
pub struct CsvEntityWriter {
    entity: String,
    out: Box<dyn CompressWriter>,
    header: Option<Vec<String>>,
    header_written: bool,
}

impl CsvEntityWriter {
    fn header_row(&self, columns: &[String]) -> Vec<String> {
        std::iter::once(TIME_COLUMN.to_string())
            .chain(columns.iter().map(|c| format!("{}.{c}", self.entity)))
            .collect()
    }
}

impl EntityResource for CsvEntityWriter {
    type Item = RenderedRecord;

    fn write(&mut self, group: &[RenderedRecord], ctx: &RunContext) -> Result<u64, SinkError> {
        let Some(first) = group.first() else {
            return Ok(0);
        };
        let mut text = String::new();

        let header = match self.header.take() {
            Some(header) => header,
            None => {
                let columns = first.columns.clone();
                if !self.header_written {
                    let row = self.header_row(&columns);
                    text.push_str(
                        &csv_text([row], csv::QuoteStyle::Necessary)
                            .context(CsvWriteSnafu { entity: &self.entity })?,
                    );
                    self.header_written = true;
                }
                columns
            }
        };

        // Cells are pre-rendered, with text values already quoted.
        let rows = group.iter().map(|record| {
            let mut row = Vec::with_capacity(header.len() + 1);
            row.push(record.timestamp.to_string());
            if record.columns == header {
                row.extend(record.cells.iter().map(|c| c.clone().unwrap_or_default()));
            } else {
                for column in &header {
                    let cell = record
                        .columns
                        .iter()
                        .position(|c| c == column)
                        .and_then(|i| record.cells.get(i).cloned().flatten());
                    row.push(cell.unwrap_or_default());
                }
            }
            row
        });
        let body = csv_text(rows, csv::QuoteStyle::Never);
        self.header = Some(header);
        text.push_str(&body.context(CsvWriteSnafu { entity: &self.entity })?);

        self.out
            .write_all(&ctx.encode(&text))
            .and_then(|_| self.out.flush())
            .context(WriteResourceSnafu { entity: &self.entity })?;
        Ok(group.len() as u64)
    }

    fn close(self, _ctx: &RunContext) -> Result<(), SinkError> {
        self.out
            .finish()
            .context(CloseResourceSnafu { entity: self.entity })
    }
}
