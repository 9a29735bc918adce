//! Run orchestration.
//!
//! A [`TransferJob`] wires the stage chain for one import or export run,
//! validates its configuration and, once started, hands out a [`RunHandle`]
//! for progress, cancellation and the final report.
//!
//! When the configuration asks for the structure sidecar, a second pipeline
//! runs first and must complete before the data pipeline starts.

use serde::Serialize;
use snafu::prelude::*;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::{MeasurementChannel, RenderChannel, StatementChannel};
use crate::config::{ExportSelection, FileFormat, REQUEST_FILE_NAME, RunConfig};
use crate::error::{
    ConfigSnafu, DeleteSnafu, PipelineError, SerializeRequestSnafu, TaskJoinSnafu,
    WriteRequestSnafu,
};
use crate::pipeline::{
    Pipeline, PipelineOutcome, ProgressSnapshot, ProgressTracker, RunContext, RunnablePipeline,
};
use crate::session::Session;
use crate::sink::{
    CsvFileFactory, EntityRouter, InsertFactory, SchemaCacheSink, SqlFileFactory,
    StatementFactory, StructureFileSink,
};
use crate::source::{
    CsvFileSource, DeviceQuerySource, SqlFileSource, StructureFileSource, StructureQuerySource,
};
use crate::statement;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Built,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Built => "built",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub state: RunState,
    pub progress: ProgressSnapshot,
}

type FinishCallback = Box<dyn FnOnce(RunState) + Send>;

/// Stage chains of one run: the optional sidecar pipeline and the data
/// pipeline.
pub struct StagePlan {
    pub structure: Option<Box<dyn RunnablePipeline>>,
    pub data: Box<dyn RunnablePipeline>,
}

/// Chains for importing files into the database.
pub fn import_pipelines(config: &RunConfig) -> StagePlan {
    let structure = config.with_structure.then(|| {
        Box::new(
            Pipeline::builder(StructureFileSource)
                .sink(SchemaCacheSink::new())
                .build(),
        ) as Box<dyn RunnablePipeline>
    });

    let data: Box<dyn RunnablePipeline> = match config.format {
        FileFormat::Csv | FileFormat::Snappy | FileFormat::Gzip | FileFormat::Lz4 => Box::new(
            Pipeline::builder(CsvFileSource::new(config.format.compression()))
                .then(MeasurementChannel)
                .sink(EntityRouter::new("insert", InsertFactory))
                .build(),
        ),
        FileFormat::Sql => Box::new(
            Pipeline::builder(SqlFileSource)
                .then(StatementChannel)
                .sink(EntityRouter::new("statement", StatementFactory))
                .build(),
        ),
    };
    StagePlan { structure, data }
}

/// Chains for exporting a selection into files.
pub fn export_pipelines(config: &RunConfig, selection: &ExportSelection) -> StagePlan {
    let structure = config.with_structure.then(|| {
        Box::new(
            Pipeline::builder(StructureQuerySource::new(selection.clone()))
                .sink(StructureFileSink::new(&config.directory))
                .build(),
        ) as Box<dyn RunnablePipeline>
    });

    let data: Box<dyn RunnablePipeline> = match config.format {
        FileFormat::Csv | FileFormat::Snappy | FileFormat::Gzip | FileFormat::Lz4 => Box::new(
            Pipeline::builder(DeviceQuerySource::new(selection.clone()))
                .then(MeasurementChannel)
                .then(RenderChannel::csv())
                .sink(EntityRouter::new("csv_file", CsvFileFactory::new(config)))
                .build(),
        ),
        FileFormat::Sql => Box::new(
            Pipeline::builder(DeviceQuerySource::new(selection.clone()))
                .then(MeasurementChannel)
                .then(RenderChannel::query(selection.include_nulls))
                .sink(EntityRouter::new("sql_file", SqlFileFactory::new(config)))
                .build(),
        ),
    };
    StagePlan { structure, data }
}

#[derive(Serialize)]
struct RunRequest<'a> {
    config: &'a RunConfig,
    selection: &'a ExportSelection,
}

fn write_request(config: &RunConfig, selection: &ExportSelection) -> Result<(), PipelineError> {
    let path = config.directory.join(REQUEST_FILE_NAME);
    let json = serde_json::to_string_pretty(&RunRequest { config, selection })
        .context(SerializeRequestSnafu)?;
    std::fs::write(&path, json).context(WriteRequestSnafu {
        path: path.display().to_string(),
    })
}

/// A configured, not yet started run.
pub struct TransferJob {
    ctx: RunContext,
    plan: StagePlan,
    on_finish: Option<FinishCallback>,
}

impl TransferJob {
    /// Import every data file of `config.directory`.
    pub fn import(config: RunConfig, session: Arc<dyn Session>) -> Result<Self, PipelineError> {
        config.validate().context(ConfigSnafu)?;
        config.ensure_readable_directory().context(ConfigSnafu)?;
        let plan = import_pipelines(&config);
        Self::new(config, session, plan)
    }

    /// Export `selection` into `config.directory`, creating it if needed.
    pub fn export(
        config: RunConfig,
        selection: ExportSelection,
        session: Arc<dyn Session>,
    ) -> Result<Self, PipelineError> {
        config.validate().context(ConfigSnafu)?;
        selection.validate().context(ConfigSnafu)?;
        config.ensure_writable_directory().context(ConfigSnafu)?;
        write_request(&config, &selection)?;
        let plan = export_pipelines(&config, &selection);
        Self::new(config, session, plan)
    }

    fn new(
        config: RunConfig,
        session: Arc<dyn Session>,
        plan: StagePlan,
    ) -> Result<Self, PipelineError> {
        let ctx = RunContext::new(config, session, CancellationToken::new()).context(ConfigSnafu)?;
        Ok(Self {
            ctx,
            plan,
            on_finish: None,
        })
    }

    /// Register a callback invoked once with the terminal state.
    pub fn on_finish<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(RunState) + Send + 'static,
    {
        self.on_finish = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> RunState {
        RunState::Built
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Spawn the run on the current runtime.
    pub fn start(self) -> RunHandle {
        let TransferJob {
            ctx,
            plan,
            on_finish,
        } = self;
        let mut trackers: Vec<Arc<ProgressTracker>> = Vec::with_capacity(2);
        if let Some(structure) = &plan.structure {
            trackers.push(structure.progress());
        }
        trackers.push(plan.data.progress());

        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let shutdown = ctx.shutdown().clone();
        let task = tokio::spawn(async move {
            let result = drive(plan, ctx).await;
            let state = match &result {
                Ok(PipelineOutcome::Completed) => RunState::Completed,
                Ok(PipelineOutcome::Cancelled) => RunState::Cancelled,
                Err(e) => {
                    error!(error = %e, "Run failed");
                    RunState::Failed
                }
            };
            state_tx.send_replace(state);
            if let Some(callback) = on_finish {
                callback(state);
            }
            result.map(|_| state)
        });

        RunHandle {
            shutdown,
            state: state_rx,
            trackers,
            task,
        }
    }
}

async fn drive(plan: StagePlan, ctx: RunContext) -> Result<PipelineOutcome, PipelineError> {
    let StagePlan { structure, data } = plan;
    if let Some(structure) = structure {
        info!(pipeline = structure.name(), "Loading structure sidecar");
        if structure.run(ctx.clone()).await? == PipelineOutcome::Cancelled {
            warn!("Run cancelled before data transfer");
            return Ok(PipelineOutcome::Cancelled);
        }
    }
    data.run(ctx).await
}

/// Control surface of a started run.
pub struct RunHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<RunState>,
    trackers: Vec<Arc<ProgressTracker>>,
    task: JoinHandle<Result<RunState, PipelineError>>,
}

impl RunHandle {
    /// Request cancellation. Calling it again has no further effect.
    pub fn shut_down(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutdown requested");
            self.shutdown.cancel();
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Finished and expected units, summed over every sink of the run.
    pub fn rate_of_process(&self) -> ProgressSnapshot {
        self.trackers.iter().map(|t| t.snapshot()).sum()
    }

    /// Rows written so far, summed over every sink of the run.
    pub fn finished_row_num(&self) -> u64 {
        self.trackers.iter().map(|t| t.finished_rows()).sum()
    }

    /// Per-entity outputs currently open.
    pub fn open_resources(&self) -> usize {
        self.trackers.iter().map(|t| t.open_resources()).sum()
    }

    /// Wait for the terminal state.
    pub async fn wait(self) -> Result<RunReport, PipelineError> {
        let RunHandle { trackers, task, .. } = self;
        let state = task.await.context(TaskJoinSnafu)??;
        Ok(RunReport {
            state,
            progress: trackers.iter().map(|t| t.snapshot()).sum(),
        })
    }
}

/// Deletes data under a path.
pub struct DeleteJob {
    session: Arc<dyn Session>,
    path: String,
    where_clause: Option<String>,
}

impl DeleteJob {
    pub fn new(session: Arc<dyn Session>, path: impl Into<String>) -> Self {
        Self {
            session,
            path: path.into(),
            where_clause: None,
        }
    }

    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub async fn run(self) -> Result<(), PipelineError> {
        ExportSelection::new(self.path.as_str())
            .validate()
            .context(ConfigSnafu)?;
        let sql = statement::delete(&self.path, self.where_clause.as_deref());
        info!(path = %self.path, "Deleting data");
        let session = self.session;
        tokio::task::spawn_blocking(move || session.execute_statement(&sql))
            .await
            .context(TaskJoinSnafu)?
            .context(DeleteSnafu { path: self.path })
    }
}
