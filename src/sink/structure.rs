//! Sinks for the schema sidecar.
//!
//! On export the sidecar is a CSV file with one row per series: the raw
//! `SHOW TIMESERIES` row followed by the device alignment. On import it is
//! loaded into the run's schema cache before any data file is read.

use snafu::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::STRUCTURE_FILE_NAME;
use crate::emit;
use crate::error::{CloseResourceSnafu, CsvWriteSnafu, OpenResourceSnafu, SinkError, WriteResourceSnafu};
use crate::metrics::events::{EntityFinished, RowsWritten};
use crate::model::SeriesSchema;
use crate::pipeline::{ProgressTracker, RunContext, Sink};

use super::csv_text;

/// Header column holding the alignment flag.
pub const ALIGNED_COLUMN: &str = "aligned";

/// Fills the run's schema cache.
pub struct SchemaCacheSink {
    progress: Arc<ProgressTracker>,
}

impl SchemaCacheSink {
    pub fn new() -> Self {
        Self {
            progress: Arc::new(ProgressTracker::new()),
        }
    }
}

impl Default for SchemaCacheSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for SchemaCacheSink {
    type Input = SeriesSchema;

    fn name(&self) -> &'static str {
        "schema_cache"
    }

    fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    fn transform(
        &mut self,
        input: &mut dyn Iterator<Item = SeriesSchema>,
        ctx: &RunContext,
    ) -> Result<(), SinkError> {
        for item in input {
            if item.entity.is_end_marker() {
                self.progress.finish_one();
                continue;
            }
            ctx.schema()
                .insert_device(item.entity.name(), item.entity.aligned);
            ctx.schema().insert_series(item.series, item.data_type);
            self.progress.add_rows(1);
        }
        debug!(series = ctx.schema().len(), "Schema cache loaded");
        Ok(())
    }

    fn close(&mut self, _ctx: &RunContext) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes the sidecar file.
pub struct StructureFileSink {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    progress: Arc<ProgressTracker>,
}

impl StructureFileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            path: directory.into().join(STRUCTURE_FILE_NAME),
            out: None,
            progress: Arc::new(ProgressTracker::new()),
        }
    }

    fn write_rows(&mut self, rows: Vec<Vec<String>>, ctx: &RunContext) -> Result<(), SinkError> {
        let entity = STRUCTURE_FILE_NAME;
        let text = csv_text(rows, csv::QuoteStyle::Necessary).context(CsvWriteSnafu { entity })?;
        if self.out.is_none() {
            let file = File::create(&self.path).context(OpenResourceSnafu {
                entity,
                path: self.path.display().to_string(),
            })?;
            self.progress.resource_opened();
            self.out = Some(BufWriter::new(file));
        }
        if let Some(out) = self.out.as_mut() {
            out.write_all(&ctx.encode(&text))
                .context(WriteResourceSnafu { entity })?;
        }
        Ok(())
    }
}

impl Sink for StructureFileSink {
    type Input = SeriesSchema;

    fn name(&self) -> &'static str {
        "structure_file"
    }

    fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    fn transform(
        &mut self,
        input: &mut dyn Iterator<Item = SeriesSchema>,
        ctx: &RunContext,
    ) -> Result<(), SinkError> {
        for item in input {
            if item.entity.is_end_marker() {
                self.progress.finish_one();
                emit!(EntityFinished { sink: self.name() });
                continue;
            }
            let mut rows = Vec::with_capacity(2);
            if self.out.is_none() {
                let mut header = item.columns.clone();
                header.push(ALIGNED_COLUMN.to_string());
                rows.push(header);
            }
            let mut row = item.values;
            row.push(item.entity.aligned.to_string());
            rows.push(row);

            self.write_rows(rows, ctx)?;
            self.progress.add_rows(1);
            emit!(RowsWritten {
                sink: self.name(),
                count: 1,
            });
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &RunContext) -> Result<(), SinkError> {
        if let Some(mut out) = self.out.take() {
            self.progress.resource_closed();
            out.flush().context(CloseResourceSnafu {
                entity: STRUCTURE_FILE_NAME,
            })?;
        }
        Ok(())
    }
}
