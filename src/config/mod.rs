//! Run configuration.
//!
//! A [`RunConfig`] is built once per run, either in code or from a YAML
//! file, validated, and then shared read-only with every stage through the
//! run context.

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::codec::Compression;
use crate::error::{
    ConfigError, CreateDirectorySnafu, EmptyDirectorySnafu, EmptyExportPathSnafu,
    NotADirectorySnafu, ReadFileSnafu, UnsupportedEncodingSnafu, YamlParseSnafu,
    ZeroBatchSizeSnafu, ZeroChannelCapacitySnafu, ZeroParallelismSnafu,
};

/// Catalog line terminator.
pub const CATALOG_LINE_END: &str = "\r\n";

/// Schema sidecar written next to exported data files.
pub const STRUCTURE_FILE_NAME: &str = "TIMESERIES_STRUCTURE.STRUCTURE";

/// Record of the configuration an export ran with.
pub const REQUEST_FILE_NAME: &str = "REQUEST.json";

/// Configuration shared by import and export runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory holding the files to import, or receiving the export.
    pub directory: PathBuf,

    /// File format.
    #[serde(default)]
    pub format: FileFormat,

    /// How exported files are named.
    #[serde(default)]
    pub naming: FileNaming,

    /// Character encoding label for file contents (default: utf-8).
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Alignment assumed for entities the database does not know yet.
    #[serde(default)]
    pub aligned: bool,

    /// Worker pool size (default: available CPUs).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Whether a structure sidecar accompanies the data files.
    #[serde(default)]
    pub with_structure: bool,

    /// Records buffered by a sink before grouping (default: 15000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Capacity of the merge channel between workers and sink (default: 1024).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_batch_size() -> usize {
    15_000
}

fn default_channel_capacity() -> usize {
    1024
}

/// File format of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Delimited text with a `Time` column and one column per series.
    #[default]
    Csv,
    /// One `INSERT` statement per line.
    Sql,
    /// Snappy-framed CSV.
    Snappy,
    /// Gzip CSV.
    Gzip,
    /// LZ4-framed CSV.
    Lz4,
}

impl FileFormat {
    /// Codec for compressed formats.
    pub fn compression(&self) -> Option<Compression> {
        match self {
            FileFormat::Snappy => Some(Compression::Snappy),
            FileFormat::Gzip => Some(Compression::Gzip),
            FileFormat::Lz4 => Some(Compression::Lz4),
            FileFormat::Csv | FileFormat::Sql => None,
        }
    }

    /// File extension, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Sql => "sql",
            other => other.compression().map_or("csv", |c| c.extension()),
        }
    }

    /// Upper-case tag used in catalog file names.
    pub fn tag(&self) -> &'static str {
        match self {
            FileFormat::Csv => "CSV",
            FileFormat::Sql => "SQL",
            FileFormat::Snappy => "SNAPPY",
            FileFormat::Gzip => "GZIP",
            FileFormat::Lz4 => "LZ4",
        }
    }

    /// Name of the shared catalog file for this format.
    pub fn catalog_file_name(&self) -> String {
        format!("CATALOG_{}.CATALOG", self.tag())
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Naming strategy for exported files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileNaming {
    /// `<entity>.<ext>`
    #[default]
    PerEntity,
    /// `<n>.<ext>` plus a shared catalog mapping numbers to entities.
    Catalog,
}

/// What an export run reads from the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSelection {
    /// Path pattern passed to `SHOW DEVICES`, e.g. `root.sg.**`.
    pub path: String,

    /// Optional filter appended as `WHERE <clause>`.
    #[serde(default)]
    pub where_clause: Option<String>,

    /// Measurements to select; empty selects every series of a device.
    #[serde(default)]
    pub measurements: Vec<String>,

    /// Emit null cells in SQL output instead of skipping them.
    #[serde(default)]
    pub include_nulls: bool,
}

impl ExportSelection {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            where_clause: None,
            measurements: Vec::new(),
            include_nulls: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.path.trim().is_empty(), EmptyExportPathSnafu);
        Ok(())
    }
}

impl RunConfig {
    /// Configuration with defaults for everything but the directory.
    pub fn new(directory: impl Into<PathBuf>, format: FileFormat) -> Self {
        Self {
            directory: directory.into(),
            format,
            naming: FileNaming::default(),
            encoding: default_encoding(),
            aligned: false,
            parallelism: default_parallelism(),
            with_structure: false,
            batch_size: default_batch_size(),
            channel_capacity: default_channel_capacity(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        let config: RunConfig = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.directory.as_os_str().is_empty(), EmptyDirectorySnafu);
        ensure!(self.parallelism > 0, ZeroParallelismSnafu);
        ensure!(self.batch_size > 0, ZeroBatchSizeSnafu);
        ensure!(self.channel_capacity > 0, ZeroChannelCapacitySnafu);
        self.text_encoding()?;
        Ok(())
    }

    /// Resolve the encoding label.
    pub fn text_encoding(&self) -> Result<&'static Encoding, ConfigError> {
        Encoding::for_label(self.encoding.trim().as_bytes()).context(UnsupportedEncodingSnafu {
            label: &self.encoding,
        })
    }

    /// Check that the import directory exists.
    pub fn ensure_readable_directory(&self) -> Result<(), ConfigError> {
        ensure!(
            self.directory.is_dir(),
            NotADirectorySnafu {
                path: self.directory.display().to_string()
            }
        );
        Ok(())
    }

    /// Create the export directory when missing.
    pub fn ensure_writable_directory(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.directory).context(CreateDirectorySnafu {
            path: self.directory.display().to_string(),
        })
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_naming(mut self, naming: FileNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_structure(mut self, with_structure: bool) -> Self {
        self.with_structure = with_structure;
        self
    }
}
