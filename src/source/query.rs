//! Database export: one unit per device.

use snafu::prelude::*;
use tracing::debug;

use crate::config::ExportSelection;
use crate::error::{EntityQuerySnafu, MalformedRowSnafu, RowQuerySnafu, StageError};
use crate::model::{EntityDescriptor, Field, Record};
use crate::pipeline::{RecordStream, RunContext, Source};
use crate::session::{RowIterator, TIME_COLUMN};
use crate::statement;

/// A device to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUnit {
    pub path: String,
    pub aligned: bool,
}

impl DeviceUnit {
    pub fn entity(&self) -> EntityDescriptor {
        EntityDescriptor::new(self.path.as_str(), self.aligned)
    }
}

/// Devices matching `path`, in the order the database lists them.
pub fn list_devices(path: &str, ctx: &RunContext) -> Result<Vec<DeviceUnit>, StageError> {
    let rows = ctx
        .session()
        .execute_query(&statement::show_devices(path))
        .context(EntityQuerySnafu)?;
    let columns = rows.column_names().to_vec();

    let mut devices = Vec::new();
    for row in rows {
        let row = row.context(EntityQuerySnafu)?;
        let device = row.text_any(&columns, &["devices", "device"]);
        if device.is_empty() {
            continue;
        }
        let aligned = row.text_any(&columns, &["isAligned", "aligned"]) == "true";
        ctx.schema().insert_device(device.as_str(), aligned);
        devices.push(DeviceUnit {
            path: device,
            aligned,
        });
    }
    debug!(path, devices = devices.len(), "Listed devices");
    Ok(devices)
}

/// Streams the rows of every device matching a selection.
///
/// Columns keep the full series names the database reports; a
/// [`MeasurementChannel`](crate::channel::MeasurementChannel) shortens them.
pub struct DeviceQuerySource {
    selection: ExportSelection,
}

impl DeviceQuerySource {
    pub fn new(selection: ExportSelection) -> Self {
        Self { selection }
    }
}

impl Source for DeviceQuerySource {
    type Unit = DeviceUnit;
    type Output = Record;

    fn name(&self) -> &'static str {
        "device_query"
    }

    fn enumerate(&self, ctx: &RunContext) -> Result<Vec<DeviceUnit>, StageError> {
        list_devices(&self.selection.path, ctx)
    }

    fn transform(&self, unit: DeviceUnit, ctx: &RunContext) -> Result<RecordStream<Record>, StageError> {
        let sql = statement::select(
            &unit.path,
            &self.selection.measurements,
            self.selection.where_clause.as_deref(),
        );
        let rows = ctx
            .session()
            .execute_query(&sql)
            .context(RowQuerySnafu {
                entity: unit.path.as_str(),
            })?;
        Ok(Box::new(DeviceRows::new(unit.entity(), rows)))
    }
}

/// Records of one device, then its end marker.
struct DeviceRows {
    entity: EntityDescriptor,
    columns: Vec<String>,
    rows: Box<dyn RowIterator>,
    failed: bool,
    done: bool,
}

impl DeviceRows {
    fn new(entity: EntityDescriptor, rows: Box<dyn RowIterator>) -> Self {
        let columns = rows.column_names().to_vec();
        Self {
            entity,
            columns,
            rows,
            failed: false,
            done: false,
        }
    }

    /// Columns holding values, without the time column.
    fn value_columns(&self) -> &[String] {
        match self.columns.first() {
            Some(first) if first.eq_ignore_ascii_case(TIME_COLUMN) => &self.columns[1..],
            _ => &self.columns,
        }
    }
}

impl Iterator for DeviceRows {
    type Item = Result<Record, StageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let next = if self.failed { None } else { self.rows.next() };
            let row = match next {
                Some(Ok(row)) => row,
                Some(Err(e)) => {
                    // The cursor is unusable after an error.
                    self.failed = true;
                    return Some(Err(e).context(RowQuerySnafu {
                        entity: self.entity.name(),
                    }));
                }
                None => {
                    self.done = true;
                    return Some(Ok(Record::end_of_entity(&self.entity)));
                }
            };

            let Some(timestamp) = row.timestamp else {
                return Some(
                    MalformedRowSnafu {
                        path: self.entity.name(),
                        line: 0u64,
                        message: "row without timestamp",
                    }
                    .fail(),
                );
            };
            let fields: Vec<Field> = self
                .value_columns()
                .iter()
                .zip(row.values)
                .map(|(column, value)| Field::new(column.as_str(), value))
                .collect();
            if fields.iter().all(|f| f.value.is_null()) {
                continue;
            }
            return Some(Ok(Record::new(self.entity.clone(), timestamp, fields)));
        }
    }
}
