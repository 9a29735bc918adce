//! CSV data files, plain or compressed.
//!
//! The first column is the timestamp. Every other header cell is a full
//! series path, optionally suffixed with its type as in
//! `root.sg.d1.s1(INT32)`. One file may hold several devices; each data row
//! yields one record per device with at least one non-null cell.

use csv::StringRecord;
use indexmap::IndexMap;
use snafu::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::codec::Compression;
use crate::error::{
    CoerceSnafu, CsvReadSnafu, MalformedRowSnafu, MalformedTimestampSnafu, SchemaQuerySnafu,
    StageError,
};
use crate::model::{DataType, EntityDescriptor, Field, FieldValue, Record};
use crate::pipeline::{RecordStream, RunContext, SchemaCache, Source};
use crate::quote::split_last_node;
use crate::session::TIME_COLUMN;
use crate::statement;

use super::files::{display_name, list_data_files, open_text};

/// Parse a timestamp cell: epoch milliseconds or an RFC 3339 date-time.
pub fn parse_timestamp(raw: &str) -> Result<i64, StageError> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return Ok(millis);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp_millis())
        .ok()
        .context(MalformedTimestampSnafu { input: raw })
}

/// Type of a series first seen through one of its values.
pub fn infer_type(raw: &str) -> DataType {
    if raw == "true" || raw == "false" {
        DataType::Boolean
    } else if raw.parse::<i64>().is_ok() {
        DataType::Int64
    } else if raw.parse::<f64>().is_ok() {
        DataType::Double
    } else {
        DataType::Text
    }
}

/// A header cell: the series path and an optional explicit type.
fn parse_header_cell(cell: &str) -> (String, Option<DataType>) {
    let cell = cell.trim();
    if let Some(open) = cell.rfind('(')
        && cell.ends_with(')')
        && let Ok(data_type) = cell[open + 1..cell.len() - 1].parse::<DataType>()
    {
        return (cell[..open].to_string(), Some(data_type));
    }
    (cell.to_string(), None)
}

#[derive(Debug)]
struct Column {
    index: usize,
    series: String,
    data_type: Option<DataType>,
}

#[derive(Debug)]
struct DeviceColumns {
    entity: EntityDescriptor,
    columns: Vec<Column>,
}

/// Column layout of one CSV file, grouped by device.
#[derive(Debug)]
pub struct CsvHeader {
    source: String,
    devices: Vec<DeviceColumns>,
}

impl CsvHeader {
    /// Group header cells by device. Devices start with `aligned`.
    pub fn parse(header: &StringRecord, source: &str, aligned: bool) -> Result<Self, StageError> {
        let malformed = |message: String| {
            MalformedRowSnafu {
                path: source,
                line: 1u64,
                message,
            }
            .build()
        };
        let first = header.get(0).map(str::trim).unwrap_or_default();
        ensure!(
            first.eq_ignore_ascii_case(TIME_COLUMN) || first.eq_ignore_ascii_case("timestamp"),
            MalformedRowSnafu {
                path: source,
                line: 1u64,
                message: format!("first column must be {TIME_COLUMN}, found {first:?}"),
            }
        );

        let mut devices: IndexMap<String, Vec<Column>> = IndexMap::new();
        for (index, cell) in header.iter().enumerate().skip(1) {
            let (series, data_type) = parse_header_cell(cell);
            let (device, _) = split_last_node(&series)
                .ok_or_else(|| malformed(format!("column {series:?} is not a series path")))?;
            devices.entry(device.to_string()).or_default().push(Column {
                index,
                series,
                data_type,
            });
        }

        Ok(Self {
            source: source.to_string(),
            devices: devices
                .into_iter()
                .map(|(device, columns)| DeviceColumns {
                    entity: EntityDescriptor::new(device, aligned),
                    columns,
                })
                .collect(),
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.devices.iter().map(|d| &d.entity)
    }

    /// Fill in column types and alignment from the schema cache, querying the
    /// database for devices the cache does not cover.
    fn resolve(&mut self, ctx: &RunContext) -> Result<(), StageError> {
        let cache = ctx.schema();
        for device in &mut self.devices {
            let name = device.entity.name().to_string();
            for column in device.columns.iter_mut().filter(|c| c.data_type.is_none()) {
                column.data_type = cache.series_type(&column.series);
            }

            if device.columns.iter().any(|c| c.data_type.is_none()) {
                let known = query_series_types(&name, ctx)?;
                for column in device.columns.iter_mut().filter(|c| c.data_type.is_none()) {
                    column.data_type = known.get(&column.series).copied();
                }
            }

            let aligned = match cache.device_alignment(&name) {
                Some(aligned) => Some(aligned),
                None => query_alignment(&name, ctx)?,
            };
            if let Some(aligned) = aligned {
                device.entity.aligned = aligned;
            }
        }
        Ok(())
    }

    /// Records of one data row, in header device order.
    ///
    /// Columns of unknown type take the type of their first non-empty cell;
    /// the choice is remembered in `cache` when one is given.
    pub fn records(
        &mut self,
        row: &StringRecord,
        line: u64,
        cache: Option<&SchemaCache>,
    ) -> Vec<Result<Record, StageError>> {
        let Some(time) = row.get(0) else {
            return vec![
                MalformedRowSnafu {
                    path: self.source.as_str(),
                    line,
                    message: "empty row",
                }
                .fail(),
            ];
        };
        let timestamp = match parse_timestamp(time) {
            Ok(t) => t,
            Err(e) => return vec![Err(e)],
        };

        let mut out = Vec::with_capacity(self.devices.len());
        for device in &mut self.devices {
            let mut fields = Vec::with_capacity(device.columns.len());
            let mut failed = None;
            for column in &mut device.columns {
                let raw = row.get(column.index).unwrap_or_default();
                if column.data_type.is_none() && !raw.is_empty() {
                    let inferred = infer_type(raw);
                    debug!(series = %column.series, data_type = %inferred, "Inferred series type");
                    if let Some(cache) = cache {
                        cache.insert_series(column.series.clone(), inferred);
                    }
                    column.data_type = Some(inferred);
                }
                let value = match column.data_type {
                    Some(data_type) => FieldValue::parse(raw, data_type)
                        .context(CoerceSnafu {
                            column: column.series.as_str(),
                        }),
                    None => Ok(FieldValue::Null),
                };
                match value {
                    Ok(value) => fields.push(Field::new(column.series.clone(), value)),
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = failed {
                out.push(Err(e));
            } else if fields.iter().any(|f| !f.value.is_null()) {
                out.push(Ok(Record::new(device.entity.clone(), timestamp, fields)));
            }
        }
        out
    }

    /// End-of-entity markers for every device of the file.
    pub fn end_markers(&self) -> Vec<Record> {
        self.entities().map(Record::end_of_entity).collect()
    }
}

/// Declared types of the series under `device`.
fn query_series_types(
    device: &str,
    ctx: &RunContext,
) -> Result<HashMap<String, DataType>, StageError> {
    let context = || SchemaQuerySnafu { entity: device };
    let rows = ctx
        .session()
        .execute_query(&statement::show_device_timeseries(device))
        .with_context(|_| context())?;
    let columns = rows.column_names().to_vec();

    let mut types = HashMap::new();
    for row in rows {
        let row = row.with_context(|_| context())?;
        let series = row.text_any(&columns, &["timeseries"]);
        if let Ok(data_type) = row.text_any(&columns, &["dataType"]).parse::<DataType>() {
            ctx.schema().insert_series(series.clone(), data_type);
            types.insert(series, data_type);
        }
    }
    Ok(types)
}

/// Alignment of `device`, or `None` when the database does not know it.
fn query_alignment(device: &str, ctx: &RunContext) -> Result<Option<bool>, StageError> {
    let context = || SchemaQuerySnafu { entity: device };
    let rows = ctx
        .session()
        .execute_query(&statement::show_devices(device))
        .with_context(|_| context())?;
    let columns = rows.column_names().to_vec();

    for row in rows {
        let row = row.with_context(|_| context())?;
        if row.text_any(&columns, &["devices", "device"]) == device {
            let aligned = row.text_any(&columns, &["isAligned", "aligned"]) == "true";
            ctx.schema().insert_device(device, aligned);
            return Ok(Some(aligned));
        }
    }
    Ok(None)
}

/// Reads CSV files of the run directory.
pub struct CsvFileSource {
    compression: Option<Compression>,
}

impl CsvFileSource {
    pub fn new(compression: Option<Compression>) -> Self {
        Self { compression }
    }
}

impl Source for CsvFileSource {
    type Unit = PathBuf;
    type Output = Record;

    fn name(&self) -> &'static str {
        match self.compression {
            Some(Compression::Snappy) => "snappy_file",
            Some(Compression::Gzip) => "gzip_file",
            Some(Compression::Lz4) => "lz4_file",
            None => "csv_file",
        }
    }

    fn enumerate(&self, ctx: &RunContext) -> Result<Vec<PathBuf>, StageError> {
        list_data_files(ctx)
    }

    fn transform(&self, path: PathBuf, ctx: &RunContext) -> Result<RecordStream<Record>, StageError> {
        let source = display_name(&path);
        let reader = open_text(&path, self.compression, ctx)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut header_row = StringRecord::new();
        let has_header = reader
            .read_record(&mut header_row)
            .context(CsvReadSnafu { path: &source })?;
        if !has_header {
            debug!(file = %source, "Empty input file");
            let entity = EntityDescriptor::new(file_stem(&path), ctx.config().aligned);
            return Ok(Box::new(std::iter::once(Ok(Record::end_of_entity(&entity)))));
        }

        let mut header = CsvHeader::parse(&header_row, &source, ctx.config().aligned)?;
        header.resolve(ctx)?;

        Ok(Box::new(CsvRecords {
            reader,
            header,
            source,
            ctx: ctx.clone(),
            row: StringRecord::new(),
            pending: VecDeque::new(),
            done: false,
        }))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| display_name(path))
}

/// Streams records of one opened file, then its end markers.
struct CsvRecords {
    reader: csv::Reader<Box<dyn Read + Send>>,
    header: CsvHeader,
    source: String,
    ctx: RunContext,
    row: StringRecord,
    pending: VecDeque<Result<Record, StageError>>,
    done: bool,
}

impl CsvRecords {
    fn finish(&mut self) {
        self.done = true;
        self.pending
            .extend(self.header.end_markers().into_iter().map(Ok));
    }
}

impl Iterator for CsvRecords {
    type Item = Result<Record, StageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            match self.reader.read_record(&mut self.row) {
                Ok(true) => {
                    let line = self.row.position().map_or(0, |p| p.line());
                    let records = self
                        .header
                        .records(&self.row, line, Some(self.ctx.schema()));
                    self.pending.extend(records);
                }
                Ok(false) => self.finish(),
                Err(e) => {
                    let fatal_read = e.is_io_error();
                    self.pending.push_back(Err(e).context(CsvReadSnafu {
                        path: self.source.as_str(),
                    }));
                    if fatal_read {
                        self.finish();
                    }
                }
            }
        }
    }
}
