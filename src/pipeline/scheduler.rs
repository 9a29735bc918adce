//! Fan-out of source units over a bounded worker pool, fan-in through one
//! bounded channel.
//!
//! Workers run on tokio's blocking pool because sources do blocking file and
//! session I/O. Each worker pulls the next unit from a shared queue, drains
//! it completely, then pulls again, so records of one unit keep their order.

use snafu::prelude::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::emit;
use crate::error::{PipelineError, StageSnafu, TaskJoinSnafu};
use crate::metrics::events::{RecordDropped, RecordsRead, UnitDuration, UnitSkipped};

use super::{RunContext, Source};

/// Counters aggregated over all workers of one pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WorkerStats {
    pub units_processed: usize,
    pub units_skipped: usize,
    pub records_sent: u64,
    pub records_dropped: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: WorkerStats) {
        self.units_processed += other.units_processed;
        self.units_skipped += other.units_skipped;
        self.records_sent += other.records_sent;
        self.records_dropped += other.records_dropped;
    }
}

type UnitQueue<U> = Arc<Mutex<VecDeque<U>>>;

/// Spawn up to `parallelism` workers draining `units` into `tx`.
pub(crate) fn spawn_workers<S: Source>(
    source: Arc<S>,
    units: Vec<S::Unit>,
    ctx: RunContext,
    tx: mpsc::Sender<S::Output>,
) -> JoinSet<Result<WorkerStats, PipelineError>> {
    let workers = ctx.config().parallelism.min(units.len());
    let queue: UnitQueue<S::Unit> = Arc::new(Mutex::new(units.into()));

    let mut set = JoinSet::new();
    for id in 0..workers {
        let source = Arc::clone(&source);
        let queue = Arc::clone(&queue);
        let ctx = ctx.clone();
        let tx = tx.clone();
        set.spawn_blocking(move || run_worker(id, source, queue, ctx, tx));
    }
    set
}

/// Wait for every worker; the first fatal error wins.
pub(crate) async fn join_workers(
    mut set: JoinSet<Result<WorkerStats, PipelineError>>,
) -> Result<WorkerStats, PipelineError> {
    let mut total = WorkerStats::default();
    let mut first_error = None;

    while let Some(joined) = set.join_next().await {
        match joined.context(TaskJoinSnafu)? {
            Ok(stats) => total.merge(stats),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(total),
    }
}

fn next_unit<U>(queue: &UnitQueue<U>) -> Option<U> {
    match queue.lock() {
        Ok(mut guard) => guard.pop_front(),
        Err(poisoned) => poisoned.into_inner().pop_front(),
    }
}

fn run_worker<S: Source>(
    id: usize,
    source: Arc<S>,
    queue: UnitQueue<S::Unit>,
    ctx: RunContext,
    tx: mpsc::Sender<S::Output>,
) -> Result<WorkerStats, PipelineError> {
    let stage = source.name();
    let mut stats = WorkerStats::default();

    while !ctx.is_cancelled() {
        let Some(unit) = next_unit(&queue) else {
            break;
        };
        let started = Instant::now();
        debug!(stage, worker = id, unit = ?unit, "Unit started");

        let records = match source.transform(unit, &ctx) {
            Ok(records) => records,
            Err(e) if e.is_fatal() => {
                ctx.shutdown().cancel();
                return Err(e).context(StageSnafu { stage });
            }
            Err(e) => {
                warn!(stage, worker = id, error = %e, "Skipping unit");
                emit!(UnitSkipped { stage });
                stats.units_skipped += 1;
                continue;
            }
        };

        let mut sent = 0u64;
        for item in records {
            if ctx.is_cancelled() {
                debug!(stage, worker = id, "Abandoning unit on shutdown");
                return Ok(stats);
            }
            match item {
                Ok(record) => {
                    if tx.blocking_send(record).is_err() {
                        debug!(stage, worker = id, "Sink closed, stopping worker");
                        return Ok(stats);
                    }
                    sent += 1;
                }
                Err(e) if e.is_fatal() => {
                    ctx.shutdown().cancel();
                    return Err(e).context(StageSnafu { stage });
                }
                Err(e) => {
                    warn!(stage, worker = id, error = %e, "Dropping record");
                    emit!(RecordDropped { stage });
                    stats.records_dropped += 1;
                }
            }
        }

        emit!(RecordsRead { stage, count: sent });
        emit!(UnitDuration {
            stage,
            duration: started.elapsed(),
        });
        stats.records_sent += sent;
        stats.units_processed += 1;
    }

    Ok(stats)
}
