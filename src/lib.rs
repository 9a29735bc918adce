//! tsbridge: bulk transfer of time-series data between flat files and a
//! time-series database.
//!
//! Import reads CSV (plain or compressed) or SQL statement files and writes
//! them through a [`Session`]; export queries devices and writes one file
//! per device. Both directions run as a streaming pipeline with a bounded
//! worker pool, per-entity outputs and cooperative cancellation.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tsbridge::{ExportSelection, FileFormat, RunConfig, RunState, TransferJob};
//!
//! let config = RunConfig::new("/data/export", FileFormat::Csv);
//! let job = TransferJob::export(config, ExportSelection::new("root.sg.**"), session)?;
//! let handle = job.start();
//! let report = handle.wait().await?;
//! assert_eq!(report.state, RunState::Completed);
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod quote;
pub mod session;
pub mod sink;
pub mod source;
pub mod statement;
pub mod transform;

// Re-export main types
pub use config::{ExportSelection, FileFormat, FileNaming, RunConfig};
pub use job::{DeleteJob, RunHandle, RunReport, RunState, TransferJob};
pub use model::{DataType, EntityDescriptor, FieldValue, Record};
pub use session::{Row, RowIterator, RowSet, Session};
pub use transform::{csv_to_inserts, transform_file};
