//! Database import: records become multi-row `INSERT` statements.

use snafu::prelude::*;
use std::sync::Arc;
use tracing::warn;

use crate::emit;
use crate::error::{InsertRowsSnafu, SinkError};
use crate::metrics::events::RecordDropped;
use crate::model::{EntityDescriptor, Record};
use crate::pipeline::RunContext;
use crate::session::Session;
use crate::statement;

use super::router::{EntityResource, ResourceFactory};

/// Upper bound on rows per statement.
const MAX_ROWS_PER_INSERT: usize = 1024;

pub struct InsertFactory;

impl ResourceFactory for InsertFactory {
    type Item = Record;
    type Resource = EntityInserter;

    fn open(
        &mut self,
        entity: &EntityDescriptor,
        ctx: &RunContext,
    ) -> Result<EntityInserter, SinkError> {
        Ok(EntityInserter {
            entity: EntityDescriptor::new(entity.name(), entity.aligned),
            session: Arc::clone(ctx.session()),
        })
    }
}

/// Inserts rows of one entity.
///
/// Consecutive records with the same non-null columns share one statement.
pub struct EntityInserter {
    entity: EntityDescriptor,
    session: Arc<dyn Session>,
}

impl EntityInserter {
    /// Run one multi-row statement; returns the rows it applied.
    ///
    /// A rejected statement drops only its own rows.
    fn execute(&self, columns: &[String], rows: &mut Vec<(i64, Vec<Option<String>>)>) -> u64 {
        if rows.is_empty() {
            return 0;
        }
        let count = rows.len() as u64;
        let sql = statement::insert(
            &self.entity,
            columns,
            rows.iter().map(|(t, literals)| (*t, literals.as_slice())),
        );
        rows.clear();
        match self.session.execute_statement(&sql).context(InsertRowsSnafu {
            entity: self.entity.name(),
        }) {
            Ok(()) => count,
            Err(e) => {
                warn!(error = %e, rows = count, "Insert rejected");
                for _ in 0..count {
                    emit!(RecordDropped { stage: "insert" });
                }
                0
            }
        }
    }
}

impl EntityResource for EntityInserter {
    type Item = Record;

    fn write(&mut self, group: &[Record], _ctx: &RunContext) -> Result<u64, SinkError> {
        let mut written = 0u64;
        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<(i64, Vec<Option<String>>)> = Vec::new();

        for record in group {
            let (record_columns, literals): (Vec<String>, Vec<Option<String>>) = record
                .fields
                .iter()
                .filter_map(|f| {
                    f.value
                        .to_query_literal()
                        .map(|literal| (f.column.clone(), Some(literal)))
                })
                .unzip();
            if record_columns.is_empty() {
                continue;
            }
            if record_columns != columns || rows.len() >= MAX_ROWS_PER_INSERT {
                written += self.execute(&columns, &mut rows);
                columns = record_columns;
            }
            rows.push((record.timestamp, literals));
        }
        written += self.execute(&columns, &mut rows);
        Ok(written)
    }

    fn close(self, _ctx: &RunContext) -> Result<(), SinkError> {
        Ok(())
    }
}
