//! Schema sidecar sources.

use csv::StringRecord;
use snafu::prelude::*;
use std::io::Read;
use std::path::PathBuf;

use crate::config::{ExportSelection, STRUCTURE_FILE_NAME};
use crate::error::{CoerceSnafu, CsvReadSnafu, MalformedRowSnafu, SchemaQuerySnafu, StageError};
use crate::model::{DataType, EntityDescriptor, FieldValue, SeriesSchema};
use crate::pipeline::{RecordStream, RunContext, Source};
use crate::quote::split_last_node;
use crate::sink::structure::ALIGNED_COLUMN;
use crate::statement;

use super::query::{DeviceUnit, list_devices};

const SERIES_COLUMN: &str = "timeseries";
const DATA_TYPE_COLUMN: &str = "dataType";

fn column_index(columns: &[String], name: &str) -> Option<usize> {
    columns.iter().position(|c| c.eq_ignore_ascii_case(name))
}

/// Reads the sidecar file of an import directory, if there is one.
pub struct StructureFileSource;

impl Source for StructureFileSource {
    type Unit = PathBuf;
    type Output = SeriesSchema;

    fn name(&self) -> &'static str {
        "structure_file"
    }

    fn enumerate(&self, ctx: &RunContext) -> Result<Vec<PathBuf>, StageError> {
        let path = ctx.config().directory.join(STRUCTURE_FILE_NAME);
        Ok(if path.is_file() { vec![path] } else { Vec::new() })
    }

    fn transform(
        &self,
        path: PathBuf,
        ctx: &RunContext,
    ) -> Result<RecordStream<SeriesSchema>, StageError> {
        let reader = super::files::open_text(&path, None, ctx)?;
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let columns: Vec<String> = reader
            .headers()
            .context(CsvReadSnafu {
                path: STRUCTURE_FILE_NAME,
            })?
            .iter()
            .map(str::to_string)
            .collect();

        let missing = |name: &str| {
            MalformedRowSnafu {
                path: STRUCTURE_FILE_NAME,
                line: 1u64,
                message: format!("missing column {name}"),
            }
            .build()
        };
        let series = column_index(&columns, SERIES_COLUMN).ok_or_else(|| missing(SERIES_COLUMN))?;
        let data_type =
            column_index(&columns, DATA_TYPE_COLUMN).ok_or_else(|| missing(DATA_TYPE_COLUMN))?;
        let aligned = column_index(&columns, ALIGNED_COLUMN);

        Ok(Box::new(SidecarRows {
            records: reader.into_records(),
            layout: SidecarLayout {
                columns,
                series,
                data_type,
                aligned,
                default_aligned: ctx.config().aligned,
            },
            done: false,
        }))
    }
}

struct SidecarLayout {
    columns: Vec<String>,
    series: usize,
    data_type: usize,
    aligned: Option<usize>,
    default_aligned: bool,
}

impl SidecarLayout {
    fn parse(&self, row: &StringRecord) -> Result<SeriesSchema, StageError> {
        let line = row.position().map_or(0, |p| p.line());
        let series = row.get(self.series).unwrap_or_default().to_string();
        let Some((device, _)) = split_last_node(&series) else {
            return MalformedRowSnafu {
                path: STRUCTURE_FILE_NAME,
                line,
                message: format!("{series:?} is not a series path"),
            }
            .fail();
        };
        let data_type = row
            .get(self.data_type)
            .unwrap_or_default()
            .parse::<DataType>()
            .context(CoerceSnafu {
                column: DATA_TYPE_COLUMN,
            })?;
        let aligned = match self.aligned.and_then(|i| row.get(i)) {
            Some(flag) => flag.trim().eq_ignore_ascii_case("true"),
            None => self.default_aligned,
        };

        let mut columns = self.columns.clone();
        let mut values: Vec<String> = row.iter().map(str::to_string).collect();
        // The alignment travels in the entity, not in the raw row.
        if let Some(i) = self.aligned.filter(|i| *i < columns.len()) {
            columns.remove(i);
            if i < values.len() {
                values.remove(i);
            }
        }

        Ok(SeriesSchema {
            entity: EntityDescriptor::new(device, aligned),
            series,
            data_type,
            columns,
            values,
        })
    }
}

struct SidecarRows {
    records: csv::StringRecordsIntoIter<Box<dyn Read + Send>>,
    layout: SidecarLayout,
    done: bool,
}

impl Iterator for SidecarRows {
    type Item = Result<SeriesSchema, StageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.records.next() {
            Some(Ok(row)) => Some(self.layout.parse(&row)),
            Some(Err(e)) => Some(Err(e).context(CsvReadSnafu {
                path: STRUCTURE_FILE_NAME,
            })),
            None => {
                self.done = true;
                let sidecar = EntityDescriptor::new(STRUCTURE_FILE_NAME, false);
                Some(Ok(SeriesSchema::end_of_entity(&sidecar)))
            }
        }
    }
}

/// Reads the schema of every device matching a selection.
pub struct StructureQuerySource {
    selection: ExportSelection,
}

impl StructureQuerySource {
    pub fn new(selection: ExportSelection) -> Self {
        Self { selection }
    }
}

impl Source for StructureQuerySource {
    type Unit = DeviceUnit;
    type Output = SeriesSchema;

    fn name(&self) -> &'static str {
        "structure_query"
    }

    fn enumerate(&self, ctx: &RunContext) -> Result<Vec<DeviceUnit>, StageError> {
        list_devices(&self.selection.path, ctx)
    }

    fn transform(
        &self,
        unit: DeviceUnit,
        ctx: &RunContext,
    ) -> Result<RecordStream<SeriesSchema>, StageError> {
        let entity = unit.entity();
        let context = || SchemaQuerySnafu {
            entity: unit.path.as_str(),
        };
        let rows = ctx
            .session()
            .execute_query(&statement::show_device_timeseries(&unit.path))
            .with_context(|_| context())?;
        let columns = rows.column_names().to_vec();

        // Schema results are small; read them eagerly so a broken cursor
        // skips the whole device.
        let mut items = Vec::new();
        for row in rows {
            let row = row.with_context(|_| context())?;
            let series = row.text_any(&columns, &[SERIES_COLUMN]);
            let data_type = row
                .text_any(&columns, &[DATA_TYPE_COLUMN])
                .parse::<DataType>()
                .context(CoerceSnafu {
                    column: series.as_str(),
                });
            items.push(data_type.map(|data_type| SeriesSchema {
                entity: entity.clone(),
                series: series.clone(),
                data_type,
                columns: columns.clone(),
                values: row
                    .values
                    .iter()
                    .map(|v| match v {
                        FieldValue::Null => String::new(),
                        other => other.to_string(),
                    })
                    .collect(),
            }));
        }
        items.push(Ok(SeriesSchema::end_of_entity(&entity)));
        Ok(Box::new(items.into_iter()))
    }
}
