//! Statement-file export: one `INSERT` per line.

use snafu::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};

use crate::config::RunConfig;
use crate::error::{CloseResourceSnafu, SinkError, WriteResourceSnafu};
use crate::model::{EntityDescriptor, RenderedRecord};
use crate::pipeline::RunContext;
use crate::statement;

use super::file::FileLayout;
use super::router::{EntityResource, ResourceFactory};

pub struct SqlFileFactory {
    layout: FileLayout,
}

impl SqlFileFactory {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            layout: FileLayout::new(config),
        }
    }
}

impl ResourceFactory for SqlFileFactory {
    type Item = RenderedRecord;
    type Resource = SqlEntityWriter;

    fn open(
        &mut self,
        entity: &EntityDescriptor,
        ctx: &RunContext,
    ) -> Result<SqlEntityWriter, SinkError> {
        let opened = self.layout.open(entity.name(), ctx)?;
        Ok(SqlEntityWriter {
            entity: EntityDescriptor::new(entity.name(), entity.aligned),
            out: BufWriter::new(opened.file),
        })
    }

    fn finish(&mut self, _ctx: &RunContext) -> Result<(), SinkError> {
        self.layout.finish()
    }
}

pub struct SqlEntityWriter {
    entity: EntityDescriptor,
    out: BufWriter<File>,
}

impl EntityResource for SqlEntityWriter {
    type Item = RenderedRecord;

    fn write(&mut self, group: &[RenderedRecord], ctx: &RunContext) -> Result<u64, SinkError> {
        let mut text = String::new();
        let mut rows = 0;
        for record in group {
            if record.columns.is_empty() {
                continue;
            }
            let line = statement::insert(
                &self.entity,
                &record.columns,
                [(record.timestamp, record.cells.as_slice())],
            );
            text.push_str(&line);
            text.push('\n');
            rows += 1;
        }

        let entity = self.entity.name();
        self.out
            .write_all(&ctx.encode(&text))
            .and_then(|_| self.out.flush())
            .context(WriteResourceSnafu { entity })?;
        Ok(rows)
    }

    fn close(mut self, _ctx: &RunContext) -> Result<(), SinkError> {
        self.out.flush().context(CloseResourceSnafu {
            entity: self.entity.name(),
        })
    }
}
