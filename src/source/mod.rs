//! Pipeline sources.
//!
//! File sources list the run directory and treat each file as one unit.
//! Query sources list devices through the session and treat each device as
//! one unit.

pub mod csv;
pub mod files;
pub mod query;
pub mod sql;
pub mod structure;

pub use self::csv::{CsvFileSource, CsvHeader, infer_type, parse_timestamp};
pub use query::{DeviceQuerySource, DeviceUnit};
pub use sql::SqlFileSource;
pub use structure::{StructureFileSource, StructureQuerySource};
