//! Scheduling cycle
//!
//! One invocation of the scheduler:
//! - Import the incoming area
//! - Pop the queue head and resolve it into build directives
//! - When the queue is empty, run RUN-timebase processes once, then
//!   dispatch one pending directive; its output re-enters the queue
//! - Stop when queue and pending directives are both empty, or on request
//!
//! Everything is single-threaded; cross-invocation coordination goes
//! through the catalog.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

use dbflow_executor::{Executor, ExecutorError};
use dbflow_inspector::InspectorRegistry;

use crate::catalog::{Catalog, CatalogError, MissionRecord, SeedError};
use crate::config::{ConfigError, Settings};
use crate::dispatch::{BuildDispatcher, BuildPlan, DispatchError, DispatchOutcome};
use crate::guard::{ConcurrencyGuard, LeaseOwner};
use crate::ingest::{ImportSummary, IngestError, Ingestor};
use crate::queue::{ProcessQueue, QueueError};
use crate::reprocess::ReprocessError;
use crate::resolver::{BuildDirective, DependencyResolver, PendingDirectives, ResolveError};
use crate::signal::EXIT_CODE_CANCELLED;
use crate::state::{FileState, Lifecycle, TransitionError};

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("catalog seed error: {0}")]
    Seed(#[from] SeedError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("reprocess error: {0}")]
    Reprocess(#[from] ReprocessError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("state error: {0}")]
    State(#[from] TransitionError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Seed(_) => 2,
            PipelineError::Catalog(CatalogError::NotFound { .. }) => 4,
            PipelineError::Reprocess(ReprocessError::Catalog(CatalogError::NotFound { .. })) => 4,
            PipelineError::Catalog(_) => 3,
            PipelineError::Queue(_) => 3,
            PipelineError::Resolve(_) => 3,
            PipelineError::Reprocess(_) => 3,
            PipelineError::State(_) => 3,
            PipelineError::Ingest(_) => 10,
            PipelineError::Dispatch(_) => 20,
            PipelineError::Executor(_) => 20,
            PipelineError::Io(_) => 1,
            PipelineError::Serialization(_) => 1,
            PipelineError::Cancelled => EXIT_CODE_CANCELLED,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Directories and switches for one cycle.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub incoming_dir: PathBuf,
    pub error_dir: PathBuf,
    /// Parent of the per-cycle build directory
    pub build_root: PathBuf,
    pub log_dir: Option<PathBuf>,
    /// Date RUN-timebase processes are resolved for
    pub run_date: NaiveDate,
    pub batch_size: usize,
    pub lease_stale_after: Duration,
    pub lock_timeout: Duration,
    pub requeue_failed_inputs: bool,
    pub dry_run: bool,
}

impl SchedulerConfig {
    /// Combine settings with the catalog's mission directories.
    pub fn from_settings(settings: &Settings, mission: &MissionRecord, dry_run: bool) -> Self {
        let root = PathBuf::from(&mission.rootdir);
        let paths = &settings.paths;
        Self {
            incoming_dir: paths.incoming_dir(&root, mission.incoming_dir.as_deref()),
            error_dir: paths.error_dir(&root, mission.error_dir.as_deref()),
            build_root: paths.build_dir.clone().unwrap_or_else(std::env::temp_dir),
            log_dir: Some(paths.log_dir(&root)),
            run_date: Local::now().date_naive(),
            batch_size: settings.scheduler.max_add,
            lease_stale_after: settings.scheduler.lease_stale_after(),
            lock_timeout: settings.catalog.busy_timeout(),
            requeue_failed_inputs: settings.scheduler.requeue_failed_inputs,
            dry_run,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub dry_run: bool,
    pub import: ImportSummary,
    /// Queue entries resolved
    pub resolved_files: usize,
    /// Queue entries naming files the catalog does not know
    pub dropped: usize,
    pub built: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Inputs put back on the queue for the next cycle
    pub requeued: usize,
    /// A stop was requested before the cycle finished
    pub stopped: bool,
    pub directives: Vec<BuildDirective>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<BuildPlan>,
    pub duration_ms: u64,
}

pub struct Scheduler<'a> {
    catalog: &'a dyn Catalog,
    registry: &'a InspectorRegistry,
    executor: &'a dyn Executor,
    config: SchedulerConfig,
    owner: LeaseOwner,
    stop: Arc<AtomicBool>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        registry: &'a InspectorRegistry,
        executor: &'a dyn Executor,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            executor,
            config,
            owner: LeaseOwner::current(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a stop flag, usually the signal handler's.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_owner(mut self, owner: LeaseOwner) -> Self {
        self.owner = owner;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn run_cycle(&self) -> PipelineResult<CycleReport> {
        let started = Instant::now();
        let cycle_id = Ulid::new().to_string();
        let _span = tracing::info_span!("cycle", id = %cycle_id, dry_run = self.config.dry_run)
            .entered();

        let queue = ProcessQueue::new(self.catalog)
            .with_dry_run(self.config.dry_run)
            .with_batch_size(self.config.batch_size);
        let guard = ConcurrencyGuard::new(
            self.catalog,
            self.owner.clone(),
            self.config.lease_stale_after,
        );
        let ingestor = Ingestor::new(self.catalog, self.registry, &queue, &self.config.error_dir);
        let build_dir = self.config.build_root.join(format!("dbflow-{}", cycle_id));
        let mut dispatcher = BuildDispatcher::new(
            self.catalog,
            &guard,
            &queue,
            &ingestor,
            self.executor,
            &build_dir,
        )
        .with_requeue_failed_inputs(self.config.requeue_failed_inputs);
        if let Some(log_dir) = &self.config.log_dir {
            dispatcher = dispatcher.with_log_dir(log_dir);
        }
        let resolver = DependencyResolver::new(self.catalog, &guard, &queue);

        let mut report = CycleReport {
            dry_run: self.config.dry_run,
            ..Default::default()
        };
        report.import = ingestor.import_incoming(&self.config.incoming_dir, self.config.lock_timeout)?;

        let result = if self.config.dry_run {
            self.plan_only(&queue, &resolver, &dispatcher, &mut report)
        } else {
            self.drain(&queue, &resolver, &dispatcher, &mut report)
                .and_then(|()| {
                    report.requeued = dispatcher.requeue_deferred(resolver.take_held_back())?;
                    Ok(())
                })
        };

        if build_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&build_dir) {
                tracing::warn!(dir = %build_dir.display(), error = %e, "cannot remove build directory");
            }
        }
        result?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            resolved_files = report.resolved_files,
            directives = report.directives.len(),
            built = report.built,
            failed = report.failed,
            skipped = report.skipped,
            requeued = report.requeued,
            stopped = report.stopped,
            "cycle finished"
        );
        Ok(report)
    }

    fn drain(
        &self,
        queue: &ProcessQueue<'_>,
        resolver: &DependencyResolver<'_>,
        dispatcher: &BuildDispatcher<'_>,
        report: &mut CycleReport,
    ) -> PipelineResult<()> {
        let mut pending = PendingDirectives::new();
        let mut run_resolved = false;

        loop {
            if self.stop_requested() {
                tracing::warn!(pending = pending.len(), "stop requested, ending cycle");
                report.stopped = true;
                while let Some(directive) = pending.pop_front() {
                    dispatcher.hold_back(&directive);
                }
                return Ok(());
            }

            if !queue.is_empty()? {
                let entry = queue.pop_entry(0)?;
                self.resolve_entry(entry.file_id, entry.version_bump, resolver, &mut pending, report)?;
                continue;
            }

            if !run_resolved {
                run_resolved = true;
                let accepted = resolver.resolve_run_processes(self.config.run_date, &mut pending)?;
                report.directives.extend(accepted);
                continue;
            }

            let Some(directive) = pending.pop_front() else {
                return Ok(());
            };

            // an earlier build this cycle may have superseded an input
            if !resolver.is_runnable(&directive)? {
                tracing::info!(%directive, "no longer runnable, skipping");
                report.skipped += 1;
                continue;
            }

            match dispatcher.dispatch(&directive) {
                Ok(DispatchOutcome::Built { .. }) => report.built += 1,
                Ok(DispatchOutcome::Skipped { .. }) => report.skipped += 1,
                Ok(DispatchOutcome::Planned { plan }) => report.plans.push(plan),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    tracing::error!(%directive, error = %e, "directive abandoned");
                    report.failed += 1;
                }
            }
        }
    }

    /// Dry run: resolve from a snapshot of the queue and plan every build.
    fn plan_only(
        &self,
        queue: &ProcessQueue<'_>,
        resolver: &DependencyResolver<'_>,
        dispatcher: &BuildDispatcher<'_>,
        report: &mut CycleReport,
    ) -> PipelineResult<()> {
        let mut pending = PendingDirectives::new();
        for entry in queue.get_all_with_bump()? {
            self.resolve_entry(entry.file_id, entry.version_bump, resolver, &mut pending, report)?;
        }
        let accepted = resolver.resolve_run_processes(self.config.run_date, &mut pending)?;
        report.directives.extend(accepted);

        while let Some(directive) = pending.pop_front() {
            match dispatcher.plan(&directive) {
                Ok(plan) => report.plans.push(plan),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(%directive, error = %e, "cannot plan build");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    fn resolve_entry(
        &self,
        file_id: i64,
        bump: Option<dbflow_model::VersionPart>,
        resolver: &DependencyResolver<'_>,
        pending: &mut PendingDirectives,
        report: &mut CycleReport,
    ) -> PipelineResult<()> {
        let Some(file) = self.catalog.file(file_id)? else {
            tracing::warn!(file_id, "queued file not in catalog, dropped");
            report.dropped += 1;
            return Ok(());
        };
        let mut lifecycle = Lifecycle::starting_at(&file.filename, FileState::Queued);
        let accepted = resolver.resolve(&file, bump, pending)?;
        lifecycle.advance(FileState::Resolved)?;
        tracing::debug!(file = %file.filename, directives = accepted.len(), "resolved");

        report.resolved_files += 1;
        report.directives.extend(accepted);
        Ok(())
    }
}
