//! Build dispatcher
//!
//! Turns a [`BuildDirective`] into an executor invocation: picks the active
//! code, resolves input paths, assigns the output version and name, expands
//! the process's extra arguments, takes the process lease and runs the
//! build. A successful output is cataloged through the ingestor and queued.

mod params;

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use dbflow_executor::{BuildRequest, BuildStatus, Executor, ExecutorError};
use dbflow_model::{CodeId, FormatError, ProcessId, Version, VersionPart};

use crate::catalog::{
    code_path, file_path, product_context, require_file, require_product, Catalog, CatalogError,
    QueueEntry,
};
use crate::guard::ConcurrencyGuard;
use crate::ingest::{BuiltOutput, IngestError, Ingestor};
use crate::queue::{ProcessQueue, QueueError};
use crate::resolver::BuildDirective;
use crate::state::{FileState, Lifecycle, TransitionError};

pub use params::{expand_params, ParamValues};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("no active code for process {process} on {date}")]
    NoActiveCode { process: String, date: NaiveDate },

    #[error("build of {process} for {date} ended {status:?} (exit code {exit_code:?})")]
    Invocation {
        process: String,
        date: NaiveDate,
        status: BuildStatus,
        exit_code: Option<i32>,
    },

    #[error("build of {process} reported success but wrote no output at {path}")]
    MissingOutput { process: String, path: PathBuf },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl DispatchError {
    /// Errors that should end the cycle; anything else abandons one
    /// directive.
    pub fn is_fatal(&self) -> bool {
        match self {
            DispatchError::Catalog(e) => e.is_storage(),
            DispatchError::Queue(QueueError::Catalog(e)) => e.is_storage(),
            DispatchError::Ingest(IngestError::Catalog(e)) => e.is_storage(),
            _ => false,
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Everything needed to run one build, resolved from the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    pub directive: BuildDirective,
    pub process_name: String,
    pub output_product: i64,
    pub code_id: CodeId,
    pub program: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub output_version: Version,
    pub extra_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl BuildPlan {
    pub fn request(&self) -> BuildRequest {
        let request = BuildRequest::new(&self.program, &self.output)
            .with_inputs(self.inputs.clone())
            .with_extra_args(self.extra_args.clone());
        match &self.log_path {
            Some(log) => request.with_log_path(log),
            None => request,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Built, cataloged and queued
    Built { file_id: i64, filename: String },
    /// Dry run: resolved but not executed
    Planned { plan: BuildPlan },
    /// Lease not available
    Skipped { process: ProcessId, reason: String },
}

pub struct BuildDispatcher<'a> {
    catalog: &'a dyn Catalog,
    guard: &'a ConcurrencyGuard<'a>,
    queue: &'a ProcessQueue<'a>,
    ingestor: &'a Ingestor<'a>,
    executor: &'a dyn Executor,
    build_dir: PathBuf,
    log_dir: Option<PathBuf>,
    dry_run: bool,
    requeue_failed_inputs: bool,
    /// Inputs to put back on the queue once the cycle has drained
    deferred: RefCell<Vec<QueueEntry>>,
}

impl<'a> BuildDispatcher<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        guard: &'a ConcurrencyGuard<'a>,
        queue: &'a ProcessQueue<'a>,
        ingestor: &'a Ingestor<'a>,
        executor: &'a dyn Executor,
        build_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            guard,
            queue,
            ingestor,
            executor,
            build_dir: build_dir.into(),
            log_dir: None,
            dry_run: queue.is_dry_run(),
            requeue_failed_inputs: false,
            deferred: RefCell::new(Vec::new()),
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_requeue_failed_inputs(mut self, requeue: bool) -> Self {
        self.requeue_failed_inputs = requeue;
        self
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Resolve a directive into a runnable plan without side effects.
    pub fn plan(&self, directive: &BuildDirective) -> DispatchResult<BuildPlan> {
        let process = self
            .catalog
            .process(directive.process_id)?
            .ok_or_else(|| CatalogError::not_found("process", directive.process_id))?;
        let code = self
            .catalog
            .active_code(process.process_id, directive.date)?
            .ok_or_else(|| DispatchError::NoActiveCode {
                process: process.process_name.clone(),
                date: directive.date,
            })?;
        let program = code_path(self.catalog, &code)?;

        let mut inputs = Vec::with_capacity(directive.inputs.len());
        for id in &directive.inputs {
            let file = require_file(self.catalog, *id)?;
            inputs.push(file_path(self.catalog, &file)?);
        }

        let product = require_product(self.catalog, process.output_product)?;
        let output_version = self.output_version(
            process.output_product,
            directive,
            code.output_version,
        )?;

        let mut context = product_context(self.catalog, &product)?
            .template_context()
            .with_date(directive.date)
            .with_version(output_version);
        context.keyword = directive.process_keyword.clone();
        let output = self.build_dir.join(context.render(&product.format)?);

        let rootdir = PathBuf::from(self.catalog.mission()?.rootdir);
        let codedir = program.parent().map(Path::to_path_buf).unwrap_or_default();
        let extra_args = expand_params(
            process.extra_params.as_deref(),
            &ParamValues {
                date: directive.date,
                outfile: &output,
                basedir: &rootdir,
                codedir: &codedir,
            },
        )?;

        let log_path = self.log_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}_{}.log",
                process.process_name,
                directive.date.format("%Y%m%d")
            ))
        });

        Ok(BuildPlan {
            directive: directive.clone(),
            process_name: process.process_name,
            output_product: process.output_product,
            code_id: code.code_id,
            program,
            inputs,
            output,
            output_version,
            extra_args,
            log_path,
        })
    }

    /// Version for the next output of `product` on the directive's date.
    ///
    /// The newest existing output with the same keyword gets the requested
    /// component bumped (revision when none was requested); with no
    /// existing output the code's base output version is used as is.
    pub fn output_version(
        &self,
        product: i64,
        directive: &BuildDirective,
        base: Version,
    ) -> DispatchResult<Version> {
        let existing = self
            .catalog
            .newest_files_on(product, directive.date)?
            .into_iter()
            .filter(|f| f.process_keyword == directive.process_keyword)
            .map(|f| f.version)
            .max();
        Ok(match existing {
            Some(version) => {
                version.bump(directive.version_bump.unwrap_or(VersionPart::Revision))?
            }
            None => base,
        })
    }

    /// Run one directive.
    pub fn dispatch(&self, directive: &BuildDirective) -> DispatchResult<DispatchOutcome> {
        let _span = tracing::info_span!(
            "dispatch",
            process = directive.process_id,
            date = %directive.date
        )
        .entered();

        let plan = self.plan(directive)?;
        if self.dry_run {
            tracing::info!(
                process = %plan.process_name,
                output = %plan.output.display(),
                "would build"
            );
            return Ok(DispatchOutcome::Planned { plan });
        }

        let Some(lease) = self.guard.acquire(directive.process_id)? else {
            self.hold_back(directive);
            return Ok(DispatchOutcome::Skipped {
                process: directive.process_id,
                reason: "process or related process running".to_string(),
            });
        };

        let output_name = plan
            .output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut lifecycle = Lifecycle::starting_at(output_name, FileState::Resolved);
        lifecycle.advance(FileState::Building)?;

        self.prepare_dirs(&plan)?;
        let request = plan.request();
        tracing::info!(
            process = %plan.process_name,
            program = %plan.program.display(),
            inputs = plan.inputs.len(),
            version = %plan.output_version,
            "starting build"
        );

        let failure = match self.executor.run(&request) {
            Ok(outcome) if outcome.is_success() && plan.output.is_file() => None,
            Ok(outcome) if outcome.is_success() => Some(DispatchError::MissingOutput {
                process: plan.process_name.clone(),
                path: plan.output.clone(),
            }),
            Ok(outcome) => Some(DispatchError::Invocation {
                process: plan.process_name.clone(),
                date: directive.date,
                status: outcome.status,
                exit_code: outcome.exit_code,
            }),
            Err(e) => Some(DispatchError::Executor(e)),
        };
        if let Some(error) = failure {
            self.abandon(&plan)?;
            lease.release()?;
            return Err(error);
        }
        lifecycle.advance(FileState::Built)?;

        let ingested = self.ingestor.ingest_built(
            &plan.output,
            BuiltOutput {
                product_id: plan.output_product,
                version: plan.output_version,
                parents: directive.inputs.clone(),
                code: plan.code_id,
            },
        );
        lease.release()?;
        let file = match ingested {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(
                    process = %plan.process_name,
                    error = %e,
                    "build succeeded but its output was not cataloged"
                );
                return Err(e.into());
            }
        };

        tracing::info!(file_id = file.file_id, filename = %file.filename, "build finished");
        Ok(DispatchOutcome::Built {
            file_id: file.file_id,
            filename: file.filename,
        })
    }

    fn prepare_dirs(&self, plan: &BuildPlan) -> DispatchResult<()> {
        let dirs = std::iter::once(plan.output.parent())
            .chain(std::iter::once(plan.log_path.as_deref().and_then(Path::parent)))
            .flatten();
        for dir in dirs {
            fs::create_dir_all(dir).map_err(|source| DispatchError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Clean up after a failed build.
    fn abandon(&self, plan: &BuildPlan) -> DispatchResult<()> {
        tracing::error!(process = %plan.process_name, date = %plan.directive.date, "build failed");
        match fs::remove_file(&plan.output) {
            Ok(()) => tracing::debug!(output = %plan.output.display(), "removed partial output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(output = %plan.output.display(), error = %e, "cannot remove partial output"),
        }
        if self.requeue_failed_inputs {
            self.hold_back(&plan.directive);
        }
        Ok(())
    }

    /// Remember the inputs of a directive that did not run this cycle.
    pub fn hold_back(&self, directive: &BuildDirective) {
        tracing::debug!(%directive, "inputs held back");
        self.deferred.borrow_mut().extend(
            directive
                .inputs
                .iter()
                .map(|id| QueueEntry::new(*id, directive.version_bump)),
        );
    }

    /// Put held-back inputs, plus `extra`, back on the queue.
    ///
    /// Called once the cycle has drained so neither a failing build nor a
    /// process running elsewhere is retried within the same cycle.
    pub fn requeue_deferred(&self, extra: Vec<QueueEntry>) -> DispatchResult<usize> {
        let mut entries = std::mem::take(&mut *self.deferred.borrow_mut());
        entries.extend(extra);
        let mut added = 0;
        for entry in entries {
            added += self.queue.rawadd(&[entry.file_id], entry.version_bump)?;
        }
        if added > 0 {
            tracing::info!(added, "re-queued deferred inputs");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    use dbflow_executor::{BuildOutcome, ExecutorResult};
    use dbflow_inspector::InspectorRegistry;
    use tempfile::TempDir;

    use crate::catalog::testing::{add_file, date, product};
    use crate::catalog::{NewCode, NewProcess, ProcessInput, SqliteCatalog};
    use crate::guard::LeaseOwner;

    /// Writes the output and records every request.
    #[derive(Default)]
    struct FakeExecutor {
        fail: bool,
        requests: RefCell<Vec<BuildRequest>>,
    }

    impl Executor for FakeExecutor {
        fn run(&self, request: &BuildRequest) -> ExecutorResult<BuildOutcome> {
            self.requests.borrow_mut().push(request.clone());
            fs::write(&request.output, b"output")?;
            if self.fail {
                Ok(BuildOutcome::failed(Some(2), 1))
            } else {
                Ok(BuildOutcome::success(1))
            }
        }
    }

    struct Env {
        root: TempDir,
        catalog: SqliteCatalog,
        process: ProcessId,
        input: crate::catalog::FileRecord,
    }

    fn env(extra_params: Option<&str>) -> Env {
        env_with(extra_params, true)
    }

    fn env_with(extra_params: Option<&str>, inspect_output: bool) -> Env {
        let root = TempDir::new().unwrap();
        let catalog = crate::catalog::testing::catalog(root.path().to_str().unwrap());
        let l0 = product(&catalog, "l0", 0.0);
        let l1 = product(&catalog, "l1", 1.0);
        if inspect_output {
            catalog.add_inspector(InspectorRegistry::TEMPLATE, l1, None).unwrap();
        }
        let process = catalog
            .add_process(&NewProcess {
                name: "make_l1".into(),
                output_product: l1,
                timebase: dbflow_model::Timebase::File,
                extra_params: extra_params.map(str::to_string),
                inputs: vec![ProcessInput {
                    product_id: l0,
                    optional: false,
                }],
            })
            .unwrap();
        catalog
            .add_code(&NewCode {
                process_id: process,
                filename: "make_l1.sh".into(),
                relative_path: "codes".into(),
                start: date(2000, 1, 1),
                stop: date(2100, 1, 1),
                code_version: Version::default(),
                output_version: Version::new(2, 0, 0),
                active: true,
            })
            .unwrap();
        let input = add_file(&catalog, l0, "l0_20200102_v1.0.0.dat", date(2020, 1, 2), Version::default());
        Env {
            root,
            catalog,
            process,
            input,
        }
    }

    fn directive(env: &Env, bump: Option<VersionPart>) -> BuildDirective {
        BuildDirective {
            process_id: env.process,
            date: date(2020, 1, 2),
            inputs: vec![env.input.file_id],
            process_keyword: None,
            version_bump: bump,
        }
    }

    #[test]
    fn test_plan_resolves_paths_and_arguments() {
        let env = env(Some("--date=%DATE -o %OUTFILE"));
        let registry = InspectorRegistry::with_builtins();
        let queue = ProcessQueue::new(&env.catalog);
        let guard = ConcurrencyGuard::new(&env.catalog, LeaseOwner::current(), Duration::from_secs(60));
        let ingestor = Ingestor::new(&env.catalog, &registry, &queue, env.root.path().join("errors"));
        let executor = FakeExecutor::default();
        let build = env.root.path().join("build");
        let dispatcher = BuildDispatcher::new(&env.catalog, &guard, &queue, &ingestor, &executor, &build);

        let plan = dispatcher.plan(&directive(&env, None)).unwrap();
        assert_eq!(plan.program, env.root.path().join("codes").join("make_l1.sh"));
        assert_eq!(plan.inputs, vec![env.root.path().join("l0").join("l0_20200102_v1.0.0.dat")]);
        assert_eq!(plan.output, build.join("l1_20200102_v2.0.0.dat"));
        assert_eq!(plan.output_version, Version::new(2, 0, 0));
        assert_eq!(
            plan.extra_args,
            vec![
                "--date".to_string(),
                "20200102".to_string(),
                "-o".to_string(),
                build.join("l1_20200102_v2.0.0.dat").display().to_string()
            ]
        );
    }

    #[test]
    fn test_output_version_bumps_existing() {
        let env = env(None);
        let registry = InspectorRegistry::with_builtins();
        let queue = ProcessQueue::new(&env.catalog);
        let guard = ConcurrencyGuard::new(&env.catalog, LeaseOwner::current(), Duration::from_secs(60));
        let ingestor = Ingestor::new(&env.catalog, &registry, &queue, env.root.path().join("errors"));
        let executor = FakeExecutor::default();
        let dispatcher = BuildDispatcher::new(&env.catalog, &guard, &queue, &ingestor, &executor, env.root.path());

        let l1 = env.catalog.product_by_name("l1").unwrap().unwrap().product_id;
        add_file(&env.catalog, l1, "l1_20200102_v2.3.4.dat", date(2020, 1, 2), Version::new(2, 3, 4));

        let base = Version::new(2, 0, 0);
        assert_eq!(
            dispatcher.output_version(l1, &directive(&env, None), base).unwrap(),
            Version::new(2, 3, 5)
        );
        assert_eq!(
            dispatcher
                .output_version(l1, &directive(&env, Some(VersionPart::Interface)), base)
                .unwrap(),
            Version::new(3, 3, 4)
        );
    }

    #[test]
    fn test_dispatch_builds_and_ingests() {
        let env = env(None);
        let registry = InspectorRegistry::with_builtins();
        let queue = ProcessQueue::new(&env.catalog);
        let guard = ConcurrencyGuard::new(&env.catalog, LeaseOwner::current(), Duration::from_secs(60));
        let ingestor = Ingestor::new(&env.catalog, &registry, &queue, env.root.path().join("errors"));
        let executor = FakeExecutor::default();
        let dispatcher = BuildDispatcher::new(
            &env.catalog,
            &guard,
            &queue,
            &ingestor,
            &executor,
            env.root.path().join("build"),
        );

        let outcome = dispatcher.dispatch(&directive(&env, None)).unwrap();
        let DispatchOutcome::Built { file_id, filename } = outcome else {
            panic!("expected a build, got {:?}", outcome);
        };
        assert_eq!(filename, "l1_20200102_v2.0.0.dat");
        assert!(env.root.path().join("l1").join(&filename).exists());
        assert_eq!(env.catalog.file_parents(file_id).unwrap(), vec![env.input.file_id]);
        assert_eq!(queue.get_all().unwrap(), vec![file_id]);
        assert!(env.catalog.leases().unwrap().is_empty());
        assert_eq!(executor.requests.borrow().len(), 1);
    }

    #[test]
    fn test_failed_build_cleans_up_and_requeues() {
        let env = env(None);
        let registry = InspectorRegistry::with_builtins();
        let queue = ProcessQueue::new(&env.catalog);
        let guard = ConcurrencyGuard::new(&env.catalog, LeaseOwner::current(), Duration::from_secs(60));
        let ingestor = Ingestor::new(&env.catalog, &registry, &queue, env.root.path().join("errors"));
        let executor = FakeExecutor {
            fail: true,
            ..Default::default()
        };
        let build = env.root.path().join("build");
        let dispatcher = BuildDispatcher::new(&env.catalog, &guard, &queue, &ingestor, &executor, &build)
            .with_requeue_failed_inputs(true);

        let err = dispatcher.dispatch(&directive(&env, None)).unwrap_err();
        assert!(matches!(err, DispatchError::Invocation { exit_code: Some(2), .. }));
        assert!(!err.is_fatal());
        assert!(!build.join("l1_20200102_v2.0.0.dat").exists());
        assert!(queue.is_empty().unwrap());
        assert_eq!(dispatcher.requeue_deferred(Vec::new()).unwrap(), 1);
        assert_eq!(queue.get_all().unwrap(), vec![env.input.file_id]);
        assert!(env.catalog.leases().unwrap().is_empty());
    }

    #[test]
    fn test_uncataloged_output_moves_to_error_area() {
        let env = env_with(None, false);
        let registry = InspectorRegistry::with_builtins();
        let queue = ProcessQueue::new(&env.catalog);
        let guard = ConcurrencyGuard::new(&env.catalog, LeaseOwner::current(), Duration::from_secs(60));
        let errors = env.root.path().join("errors");
        let ingestor = Ingestor::new(&env.catalog, &registry, &queue, &errors);
        let executor = FakeExecutor::default();
        let build = env.root.path().join("build");
        let dispatcher = BuildDispatcher::new(&env.catalog, &guard, &queue, &ingestor, &executor, &build);

        let err = dispatcher.dispatch(&directive(&env, None)).unwrap_err();
        assert!(matches!(err, DispatchError::Ingest(IngestError::Unclaimed(_))));
        assert!(!err.is_fatal());
        assert!(!build.join("l1_20200102_v2.0.0.dat").exists());
        assert_eq!(
            fs::read(errors.join("l1_20200102_v2.0.0.dat")).unwrap(),
            b"output"
        );
        assert!(env.catalog.file_by_name("l1_20200102_v2.0.0.dat").unwrap().is_none());
        assert!(queue.is_empty().unwrap());
        assert!(env.catalog.leases().unwrap().is_empty());
    }

    #[test]
    fn test_held_lease_skips() {
        let env = env(None);
        let registry = InspectorRegistry::with_builtins();
        let queue = ProcessQueue::new(&env.catalog);
        let guard = ConcurrencyGuard::new(&env.catalog, LeaseOwner::current(), Duration::from_secs(60));
        let ingestor = Ingestor::new(&env.catalog, &registry, &queue, env.root.path().join("errors"));
        let executor = FakeExecutor::default();
        let dispatcher = BuildDispatcher::new(&env.catalog, &guard, &queue, &ingestor, &executor, env.root.path().join("build"));

        let held = guard.acquire(env.process).unwrap().unwrap();
        let outcome = dispatcher
            .dispatch(&directive(&env, Some(VersionPart::Quality)))
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Skipped { .. }));
        assert!(executor.requests.borrow().is_empty());
        held.release().unwrap();

        // the skipped inputs come back with their bump
        assert_eq!(dispatcher.requeue_deferred(Vec::new()).unwrap(), 1);
        let entries = queue.get_all_with_bump().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_id, env.input.file_id);
        assert_eq!(entries[0].version_bump, Some(VersionPart::Quality));
        assert_eq!(dispatcher.requeue_deferred(Vec::new()).unwrap(), 0);
    }

    #[test]
    fn test_dry_run_plans_only() {
        let env = env(None);
        let registry = InspectorRegistry::with_builtins();
        let queue = ProcessQueue::new(&env.catalog).with_dry_run(true);
        let guard = ConcurrencyGuard::new(&env.catalog, LeaseOwner::current(), Duration::from_secs(60));
        let ingestor = Ingestor::new(&env.catalog, &registry, &queue, env.root.path().join("errors"));
        let executor = FakeExecutor::default();
        let dispatcher = BuildDispatcher::new(&env.catalog, &guard, &queue, &ingestor, &executor, env.root.path().join("build"));

        let outcome = dispatcher.dispatch(&directive(&env, None)).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Planned { .. }));
        assert!(executor.requests.borrow().is_empty());
        assert!(env.catalog.leases().unwrap().is_empty());
    }
}
