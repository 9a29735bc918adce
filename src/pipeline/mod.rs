//! Generic streaming pipeline.
//!
//! A pipeline is a chain of typed stages: one [`Source`], any number of
//! [`Channel`]s and one [`Sink`]. The builder checks adjacent stage types at
//! compile time:
//!
//! ```ignore
//! let pipeline = Pipeline::builder(CsvFileSource::new(None))
//!     .then(MeasurementChannel)
//!     .sink(EntityRouter::new("insert", InsertFactory))
//!     .build();
//! let outcome = pipeline.run(ctx).await?;
//! ```
//!
//! # Architecture
//!
//! - **Enumeration**: the source lists its units (files or query results) on
//!   the blocking pool. This fixes the expected total.
//! - **Workers**: `parallelism` blocking tasks pull units from a shared queue
//!   and drain each one into a bounded merge channel. A full channel blocks
//!   workers, which gives backpressure against a slow sink.
//! - **Sink**: one blocking task consumes the merged stream and routes it to
//!   per-entity outputs.

pub mod context;
pub mod progress;
mod scheduler;

use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::prelude::*;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, SinkError, SinkSnafu, StageError, StageSnafu, TaskJoinSnafu};

pub use context::{RunContext, SchemaCache};
pub use progress::{ProgressSnapshot, ProgressTracker};

/// Stream of items produced by a stage. An `Err` item drops that one record.
pub type RecordStream<T> = Box<dyn Iterator<Item = Result<T, StageError>> + Send>;

/// First stage of a pipeline.
pub trait Source: Send + Sync + 'static {
    /// Independent piece of input, processed by one worker.
    type Unit: Send + fmt::Debug + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// List every unit of input.
    fn enumerate(&self, ctx: &RunContext) -> Result<Vec<Self::Unit>, StageError>;

    /// Open one unit and stream its records.
    ///
    /// The stream must end with an end-of-entity marker for every entity the
    /// unit produced.
    fn transform(
        &self,
        unit: Self::Unit,
        ctx: &RunContext,
    ) -> Result<RecordStream<Self::Output>, StageError>;
}

/// Intermediate stage reformatting or validating a stream.
pub trait Channel: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn transform(
        self: Arc<Self>,
        input: RecordStream<Self::Input>,
        ctx: &RunContext,
    ) -> RecordStream<Self::Output>;
}

/// Last stage of a pipeline.
pub trait Sink: Send + 'static {
    type Input: Send + 'static;

    fn name(&self) -> &'static str;

    /// Counters readable while the sink runs.
    fn progress(&self) -> Arc<ProgressTracker>;

    /// Consume the merged stream until it ends or the run is cancelled.
    fn transform(
        &mut self,
        input: &mut dyn Iterator<Item = Self::Input>,
        ctx: &RunContext,
    ) -> Result<(), SinkError>;

    /// Flush and close everything still open. Called on every exit path.
    fn close(&mut self, ctx: &RunContext) -> Result<(), SinkError>;
}

/// A source followed by a channel, itself usable as a source.
pub struct Chained<S, C> {
    source: S,
    channel: Arc<C>,
}

impl<S, C> Source for Chained<S, C>
where
    S: Source,
    C: Channel<Input = S::Output>,
{
    type Unit = S::Unit;
    type Output = C::Output;

    fn name(&self) -> &'static str {
        self.source.name()
    }

    fn enumerate(&self, ctx: &RunContext) -> Result<Vec<Self::Unit>, StageError> {
        self.source.enumerate(ctx)
    }

    fn transform(
        &self,
        unit: Self::Unit,
        ctx: &RunContext,
    ) -> Result<RecordStream<Self::Output>, StageError> {
        let input = self.source.transform(unit, ctx)?;
        Ok(Arc::clone(&self.channel).transform(input, ctx))
    }
}

/// Placeholder until a sink is attached.
pub struct NoSink;

/// Builder chaining stages with compile-time type checks.
pub struct PipelineBuilder<S, K = NoSink> {
    source: S,
    sink: K,
}

impl<S: Source> PipelineBuilder<S, NoSink> {
    /// Append a channel.
    pub fn then<C>(self, channel: C) -> PipelineBuilder<Chained<S, C>, NoSink>
    where
        C: Channel<Input = S::Output>,
    {
        PipelineBuilder {
            source: Chained {
                source: self.source,
                channel: Arc::new(channel),
            },
            sink: NoSink,
        }
    }

    /// Attach the sink.
    pub fn sink<K>(self, sink: K) -> PipelineBuilder<S, K>
    where
        K: Sink<Input = S::Output>,
    {
        PipelineBuilder {
            source: self.source,
            sink,
        }
    }
}

impl<S, K> PipelineBuilder<S, K>
where
    S: Source,
    K: Sink<Input = S::Output>,
{
    pub fn build(self) -> Pipeline<S, K> {
        Pipeline {
            source: Arc::new(self.source),
            sink: self.sink,
        }
    }
}

/// How a pipeline run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Cancelled,
}

/// A runnable chain of stages.
pub struct Pipeline<S, K> {
    source: Arc<S>,
    sink: K,
}

impl<S: Source> Pipeline<S, NoSink> {
    /// Start a builder from a source.
    pub fn builder(source: S) -> PipelineBuilder<S, NoSink> {
        PipelineBuilder { source, sink: NoSink }
    }
}

impl<S, K> Pipeline<S, K>
where
    S: Source,
    K: Sink<Input = S::Output>,
{
    pub fn name(&self) -> &'static str {
        self.sink.name()
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.sink.progress()
    }

    /// Run to completion, cancellation or failure.
    ///
    /// Fatal errors cancel the run token so every other stage winds down.
    pub async fn run(self, ctx: RunContext) -> Result<PipelineOutcome, PipelineError> {
        let Pipeline { source, mut sink } = self;
        let stage = source.name();
        let progress = sink.progress();

        if ctx.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }

        let units = {
            let source = Arc::clone(&source);
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || source.enumerate(&ctx))
                .await
                .context(TaskJoinSnafu)?
        };
        let units = match units {
            Ok(units) => units,
            Err(e) => {
                ctx.shutdown().cancel();
                return Err(e).context(StageSnafu { stage });
            }
        };
        progress.set_total(units.len() as u64);
        info!(
            stage,
            sink = sink.name(),
            units = units.len(),
            "Pipeline starting"
        );

        let (tx, rx) = mpsc::channel(ctx.config().channel_capacity);
        let workers = scheduler::spawn_workers(source, units, ctx.clone(), tx);

        let sink_ctx = ctx.clone();
        let sink_task = tokio::task::spawn_blocking(move || {
            let sink_name = sink.name();
            let mut input = MergedInput::new(rx, sink_ctx.shutdown().clone());
            let written = sink.transform(&mut input, &sink_ctx);
            // Dropping the receiver releases workers blocked on a full channel.
            drop(input);
            let closed = sink.close(&sink_ctx);
            let result = written.and(closed);
            if result.is_err() {
                sink_ctx.shutdown().cancel();
            }
            result.context(SinkSnafu { stage: sink_name })
        });

        let worker_result = scheduler::join_workers(workers).await;
        let sink_result = sink_task.await.context(TaskJoinSnafu)?;

        let stats = worker_result?;
        sink_result?;

        let snapshot = progress.snapshot();
        if ctx.is_cancelled() {
            warn!(
                stage,
                finished = snapshot.finished,
                total = snapshot.total,
                "Pipeline cancelled"
            );
            return Ok(PipelineOutcome::Cancelled);
        }

        debug!(
            stage,
            units = stats.units_processed,
            skipped = stats.units_skipped,
            dropped = stats.records_dropped,
            "Workers drained"
        );
        info!(
            stage,
            finished = snapshot.finished,
            total = snapshot.total,
            rows = snapshot.rows,
            "Pipeline completed"
        );
        Ok(PipelineOutcome::Completed)
    }
}

/// Type-erased pipeline, so jobs can hold chains of different stage types.
pub trait RunnablePipeline: Send {
    fn name(&self) -> &'static str;

    fn progress(&self) -> Arc<ProgressTracker>;

    fn run(self: Box<Self>, ctx: RunContext)
    -> BoxFuture<'static, Result<PipelineOutcome, PipelineError>>;
}

impl<S, K> RunnablePipeline for Pipeline<S, K>
where
    S: Source,
    K: Sink<Input = S::Output>,
{
    fn name(&self) -> &'static str {
        Pipeline::name(self)
    }

    fn progress(&self) -> Arc<ProgressTracker> {
        Pipeline::progress(self)
    }

    fn run(
        self: Box<Self>,
        ctx: RunContext,
    ) -> BoxFuture<'static, Result<PipelineOutcome, PipelineError>> {
        Pipeline::run(*self, ctx).boxed()
    }
}

/// The merged worker output as seen by the sink.
///
/// Ends when every worker has dropped its sender or the run is cancelled.
struct MergedInput<T> {
    rx: mpsc::Receiver<T>,
    shutdown: CancellationToken,
}

impl<T> MergedInput<T> {
    fn new(rx: mpsc::Receiver<T>, shutdown: CancellationToken) -> Self {
        Self { rx, shutdown }
    }
}

impl<T> Iterator for MergedInput<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        self.rx.blocking_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::context::test_support::{NullSession, context};
    use super::*;
    use crate::config::{FileFormat, RunConfig};
    use std::sync::Mutex;

    /// Source yielding `count` numbers per unit, failing on multiples of 7.
    struct Numbers {
        units: usize,
        count: u32,
    }

    impl Source for Numbers {
        type Unit = usize;
        type Output = u32;

        fn name(&self) -> &'static str {
            "numbers"
        }

        fn enumerate(&self, _ctx: &RunContext) -> Result<Vec<usize>, StageError> {
            Ok((0..self.units).collect())
        }

        fn transform(&self, unit: usize, _ctx: &RunContext) -> Result<RecordStream<u32>, StageError> {
            let base = unit as u32 * 1000;
            Ok(Box::new((0..self.count).map(move |i| {
                if i > 0 && i % 7 == 0 {
                    crate::error::MalformedStatementSnafu {
                        statement: i.to_string(),
                    }
                    .fail()
                } else {
                    Ok(base + i)
                }
            })))
        }
    }

    struct Doubler;

    impl Channel for Doubler {
        type Input = u32;
        type Output = u64;

        fn name(&self) -> &'static str {
            "doubler"
        }

        fn transform(
            self: Arc<Self>,
            input: RecordStream<u32>,
            _ctx: &RunContext,
        ) -> RecordStream<u64> {
            Box::new(input.map(|r| r.map(|v| u64::from(v) * 2)))
        }
    }

    struct Collect {
        seen: Arc<Mutex<Vec<u64>>>,
        progress: Arc<ProgressTracker>,
        closed: Arc<Mutex<bool>>,
    }

    impl Sink for Collect {
        type Input = u64;

        fn name(&self) -> &'static str {
            "collect"
        }

        fn progress(&self) -> Arc<ProgressTracker> {
            self.progress.clone()
        }

        fn transform(
            &mut self,
            input: &mut dyn Iterator<Item = u64>,
            _ctx: &RunContext,
        ) -> Result<(), SinkError> {
            for value in input {
                self.seen.lock().unwrap().push(value);
                self.progress.add_rows(1);
            }
            Ok(())
        }

        fn close(&mut self, _ctx: &RunContext) -> Result<(), SinkError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn collector() -> (Collect, Arc<Mutex<Vec<u64>>>, Arc<Mutex<bool>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let sink = Collect {
            seen: seen.clone(),
            progress: Arc::new(ProgressTracker::new()),
            closed: closed.clone(),
        };
        (sink, seen, closed)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipeline_preserves_per_unit_order_and_drops_bad_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = RunConfig::new(dir.path(), FileFormat::Csv);
        config.parallelism = 3;
        config.channel_capacity = 2;
        let ctx = RunContext::new(config, Arc::new(NullSession), CancellationToken::new()).unwrap();

        let (sink, seen, closed) = collector();
        let pipeline = Pipeline::builder(Numbers { units: 4, count: 20 })
            .then(Doubler)
            .sink(sink)
            .build();
        let progress = pipeline.progress();

        let outcome = pipeline.run(ctx).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert!(*closed.lock().unwrap());

        let seen = seen.lock().unwrap().clone();
        // 20 values per unit minus 7 and 14.
        assert_eq!(seen.len(), 4 * 18);
        assert_eq!(progress.snapshot().total, 4);
        assert_eq!(progress.finished_rows(), 72);

        for unit in 0..4u64 {
            let values: Vec<u64> = seen
                .iter()
                .copied()
                .filter(|v| *v / 2000 == unit)
                .collect();
            let mut sorted = values.clone();
            sorted.sort_unstable();
            assert_eq!(values, sorted, "unit {unit} out of order");
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), FileFormat::Csv);
        ctx.shutdown().cancel();

        let (sink, seen, _) = collector();
        let pipeline = Pipeline::builder(Numbers { units: 2, count: 3 })
            .then(Doubler)
            .sink(sink)
            .build();

        assert_eq!(
            pipeline.run(ctx).await.unwrap(),
            PipelineOutcome::Cancelled
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_units_completes() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), FileFormat::Csv);

        let (sink, _, closed) = collector();
        let pipeline = Pipeline::builder(Numbers { units: 0, count: 3 })
            .then(Doubler)
            .sink(sink)
            .build();
        let progress = pipeline.progress();

        assert_eq!(
            pipeline.run(ctx).await.unwrap(),
            PipelineOutcome::Completed
        );
        assert!(*closed.lock().unwrap());
        assert_eq!(progress.snapshot().total, 0);
    }

    /// Source whose second unit cannot be opened.
    struct Unopenable;

    impl Source for Unopenable {
        type Unit = usize;
        type Output = u64;

        fn name(&self) -> &'static str {
            "unopenable"
        }

        fn enumerate(&self, _ctx: &RunContext) -> Result<Vec<usize>, StageError> {
            Ok(vec![0, 1])
        }

        fn transform(&self, unit: usize, _ctx: &RunContext) -> Result<RecordStream<u64>, StageError> {
            if unit == 1 {
                return Err(std::io::Error::from(std::io::ErrorKind::NotFound)).context(
                    crate::error::OpenInputSnafu {
                        path: "missing.csv",
                    },
                );
            }
            Ok(Box::new(std::iter::once(Ok(1))))
        }
    }

    #[tokio::test]
    async fn test_fatal_open_error_fails_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), FileFormat::Csv);

        let (sink, _, closed) = collector();
        let pipeline = Pipeline::builder(Unopenable).sink(sink).build();

        let err = pipeline.run(ctx.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage {
                source: StageError::OpenInput { .. },
                ..
            }
        ));
        assert!(ctx.is_cancelled());
        assert!(*closed.lock().unwrap());
    }
}
