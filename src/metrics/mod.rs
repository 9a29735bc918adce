//! Metrics for tsbridge runs.
//!
//! - `events`: Internal event types and the `InternalEvent` trait

pub mod events;

/// Emit an internal event.
///
/// This macro calls the `InternalEvent::emit()` method on the given event,
/// which records the corresponding metric.
///
/// # Example
///
/// ```ignore
/// use tsbridge::metrics::events::RowsWritten;
///
/// emit!(RowsWritten { sink: "csv", count: 100 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
