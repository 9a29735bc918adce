//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a run. Events
//! implement the `InternalEvent` trait which records the matching metric
//! through the `metrics` facade. Without an installed recorder the calls
//! are no-ops.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a worker pushes records into the merge channel.
pub struct RecordsRead<'a> {
    pub stage: &'a str,
    pub count: u64,
}

impl InternalEvent for RecordsRead<'_> {
    fn emit(self) {
        trace!(stage = self.stage, count = self.count, "Records read");
        counter!("tsbridge_records_read_total", "stage" => self.stage.to_string())
            .increment(self.count);
    }
}

/// Event emitted when a record is dropped because it could not be produced.
pub struct RecordDropped<'a> {
    pub stage: &'a str,
}

impl InternalEvent for RecordDropped<'_> {
    fn emit(self) {
        trace!(stage = self.stage, "Record dropped");
        counter!("tsbridge_records_dropped_total", "stage" => self.stage.to_string())
            .increment(1);
    }
}

/// Event emitted when rows reach an output resource.
pub struct RowsWritten<'a> {
    pub sink: &'a str,
    pub count: u64,
}

impl InternalEvent for RowsWritten<'_> {
    fn emit(self) {
        trace!(sink = self.sink, count = self.count, "Rows written");
        counter!("tsbridge_rows_written_total", "sink" => self.sink.to_string())
            .increment(self.count);
    }
}

/// Event emitted when an end-of-entity marker is consumed.
pub struct EntityFinished<'a> {
    pub sink: &'a str,
}

impl InternalEvent for EntityFinished<'_> {
    fn emit(self) {
        trace!(sink = self.sink, "Entity finished");
        counter!("tsbridge_entities_finished_total", "sink" => self.sink.to_string())
            .increment(1);
    }
}

/// Event emitted when an entity's output fails and its rows are dropped.
pub struct EntityFailed<'a> {
    pub sink: &'a str,
}

impl InternalEvent for EntityFailed<'_> {
    fn emit(self) {
        trace!(sink = self.sink, "Entity failed");
        counter!("tsbridge_entities_failed_total", "sink" => self.sink.to_string())
            .increment(1);
    }
}

/// Event emitted when an input unit is skipped.
pub struct UnitSkipped<'a> {
    pub stage: &'a str,
}

impl InternalEvent for UnitSkipped<'_> {
    fn emit(self) {
        trace!(stage = self.stage, "Unit skipped");
        counter!("tsbridge_units_skipped_total", "stage" => self.stage.to_string())
            .increment(1);
    }
}

/// Current number of open per-entity outputs of one sink.
pub struct OpenResources<'a> {
    pub sink: &'a str,
    pub count: usize,
}

impl InternalEvent for OpenResources<'_> {
    fn emit(self) {
        gauge!("tsbridge_open_resources", "sink" => self.sink.to_string())
            .set(self.count as f64);
    }
}

/// Event emitted when a unit has been fully drained by a worker.
pub struct UnitDuration<'a> {
    pub stage: &'a str,
    pub duration: Duration,
}

impl InternalEvent for UnitDuration<'_> {
    fn emit(self) {
        histogram!("tsbridge_unit_duration_seconds", "stage" => self.stage.to_string())
            .record(self.duration.as_secs_f64());
    }
}
