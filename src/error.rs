//! Error types for tsbridge using snafu.
//!
//! Errors are grouped by the layer that produces them. Record-level and
//! unit-level failures live in [`StageError`], resource-level failures in
//! [`SinkError`], and everything that ends a run surfaces as
//! [`PipelineError`].

use snafu::prelude::*;

use crate::model::value::DataType;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Target directory is empty.
    #[snafu(display("Directory cannot be empty"))]
    EmptyDirectory,

    /// Import directory does not exist or is not a directory.
    #[snafu(display("Not a readable directory: {path}"))]
    NotADirectory { path: String },

    /// Export directory could not be created.
    #[snafu(display("Failed to create directory {path}"))]
    CreateDirectory {
        source: std::io::Error,
        path: String,
    },

    /// Encoding label is not known.
    #[snafu(display("Unsupported character encoding: {label}"))]
    UnsupportedEncoding { label: String },

    /// Worker pool size must be positive.
    #[snafu(display("Parallelism must be at least 1"))]
    ZeroParallelism,

    /// Router batch size must be positive.
    #[snafu(display("Batch size must be at least 1"))]
    ZeroBatchSize,

    /// Merge channel capacity must be positive.
    #[snafu(display("Channel capacity must be at least 1"))]
    ZeroChannelCapacity,

    /// Export selection has no path.
    #[snafu(display("Export path cannot be empty"))]
    EmptyExportPath,

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Session Errors ============

/// Errors reported by a database session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SessionError {
    /// A query was rejected or failed while streaming rows.
    #[snafu(display("Query `{sql}` failed: {message}"))]
    Query { sql: String, message: String },

    /// A statement was rejected.
    #[snafu(display("Statement `{sql}` failed: {message}"))]
    Statement { sql: String, message: String },

    /// The session lost its connection.
    #[snafu(display("Session connection failed: {message}"))]
    Connection { message: String },
}

// ============ Value Errors ============

/// Errors produced by typed field values.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValueError {
    /// Accessor does not match the live tag.
    #[snafu(display("Expected a {expected} value, found {actual}"))]
    TypeMismatch { expected: DataType, actual: String },

    /// Raw text cannot be parsed as the column type.
    #[snafu(display("Cannot parse {input:?} as {data_type}"))]
    Malformed { data_type: DataType, input: String },

    /// Type name is not one of the supported primitive kinds.
    #[snafu(display("Unknown data type: {name}"))]
    UnknownDataType { name: String },
}

// ============ Stage Errors ============

/// Errors raised by sources and channels.
///
/// Errors yielded by a record stream drop that record. Errors returned while
/// opening a unit skip the unit, unless [`StageError::is_fatal`] says the
/// whole run must stop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StageError {
    /// Input unit could not be opened.
    #[snafu(display("Failed to open input {path}"))]
    OpenInput {
        source: std::io::Error,
        path: String,
    },

    /// Input directory could not be listed.
    #[snafu(display("Failed to list input directory {path}"))]
    ListInput {
        source: std::io::Error,
        path: String,
    },

    /// Reading from an opened input failed.
    #[snafu(display("Failed to read {path}: {source}"))]
    ReadInput {
        source: std::io::Error,
        path: String,
    },

    /// The CSV tokenizer rejected a row.
    #[snafu(display("Malformed CSV in {path}: {source}"))]
    CsvRead { source: csv::Error, path: String },

    /// A row is structurally invalid.
    #[snafu(display("Malformed row {line} in {path}: {message}"))]
    MalformedRow {
        path: String,
        line: u64,
        message: String,
    },

    /// A timestamp cell is neither epoch millis nor RFC 3339.
    #[snafu(display("Malformed timestamp {input:?}"))]
    MalformedTimestamp { input: String },

    /// A cell failed type coercion.
    #[snafu(display("Column {column}: {source}"))]
    Coerce { column: String, source: ValueError },

    /// Schema lookup for one entity failed.
    #[snafu(display("Schema lookup for {entity} failed: {source}"))]
    SchemaQuery {
        entity: String,
        source: SessionError,
    },

    /// Listing entities failed.
    #[snafu(display("Entity query failed: {source}"))]
    EntityQuery { source: SessionError },

    /// Reading the rows of one entity failed.
    #[snafu(display("Row query for {entity} failed: {source}"))]
    RowQuery {
        entity: String,
        source: SessionError,
    },

    /// A statement line cannot be reformatted.
    #[snafu(display("Malformed statement: {statement}"))]
    MalformedStatement { statement: String },
}

impl StageError {
    /// Whether this error must fail the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StageError::OpenInput { .. }
                | StageError::ListInput { .. }
                | StageError::EntityQuery { .. }
        )
    }
}

// ============ Sink Errors ============

/// Errors raised while writing to a per-entity resource.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Output resource could not be opened.
    #[snafu(display("Failed to open output for {entity} at {path}: {source}"))]
    OpenResource {
        source: std::io::Error,
        entity: String,
        path: String,
    },

    /// Writing a group failed.
    #[snafu(display("Failed to write rows for {entity}: {source}"))]
    WriteResource {
        source: std::io::Error,
        entity: String,
    },

    /// The CSV printer rejected a row.
    #[snafu(display("Failed to encode CSV row for {entity}: {source}"))]
    CsvWrite { source: csv::Error, entity: String },

    /// Flushing or finishing an output failed.
    #[snafu(display("Failed to close output for {entity}: {source}"))]
    CloseResource {
        source: std::io::Error,
        entity: String,
    },

    /// The database rejected an insert.
    #[snafu(display("Insert into {entity} failed: {source}"))]
    InsertRows {
        source: SessionError,
        entity: String,
    },

    /// The shared catalog file could not be written.
    #[snafu(display("Failed to write catalog {path}: {source}"))]
    WriteCatalog {
        source: std::io::Error,
        path: String,
    },
}

// ============ Pipeline Errors ============

/// Top-level errors that end a run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// A stage hit a fatal error.
    #[snafu(display("Stage {stage} failed"))]
    Stage { stage: String, source: StageError },

    /// A sink hit a fatal error.
    #[snafu(display("Sink {stage} failed"))]
    Sink { stage: String, source: SinkError },

    /// Task join error.
    #[snafu(display("Task join error"))]
    TaskJoin { source: tokio::task::JoinError },

    /// The request record could not be serialized.
    #[snafu(display("Failed to serialize run request"))]
    SerializeRequest { source: serde_json::Error },

    /// The request record could not be written.
    #[snafu(display("Failed to write run request to {path}"))]
    WriteRequest {
        source: std::io::Error,
        path: String,
    },

    /// A delete statement failed.
    #[snafu(display("Delete of {path} failed"))]
    Delete { path: String, source: SessionError },

    /// Offline transformation failed.
    #[snafu(display("Transformation failed"))]
    Transform { source: StageError },

    /// Writing CLI output failed.
    #[snafu(display("Failed to write output to {path}"))]
    OutputWrite {
        source: std::io::Error,
        path: String,
    },
}
