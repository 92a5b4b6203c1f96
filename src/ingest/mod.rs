//! Ingestion
//!
//! Walks a file through INCOMING → CLASSIFIED → CATALOGED → STAGED →
//! QUEUED. Newly arrived files come from the incoming area; built outputs
//! come from the dispatcher's build directory and carry their provenance.
//!
//! The catalog insert, the newest-version recompute and the move to the
//! canonical location share one transaction: a failed move rolls the
//! insert back.

mod lock;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use dbflow_inspector::{Candidate, ClassifyError, FileDescription, InspectorRegistry};
use dbflow_model::{CodeId, FileId, ProductId, TemplateContext, Version};

use crate::catalog::{
    product_context, product_dir, require_product, Catalog, CatalogError, FileRecord,
    FileSelector, NewFile,
};
use crate::queue::{ProcessQueue, QueueError};
use crate::state::{FileState, Lifecycle, TransitionError};

pub use lock::{IncomingLock, LockError, LockResult};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("no inspector claimed built output {0}")]
    Unclaimed(PathBuf),

    #[error("built output {path} recognised as product {found}, expected {expected}")]
    ProductMismatch {
        path: PathBuf,
        expected: ProductId,
        found: ProductId,
    },
}

impl IngestError {
    /// Errors that must stop the whole import rather than one file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Classify(ClassifyError::Ambiguous { .. }) | IngestError::Lock(_)
        )
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// What happened to one incoming file.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Cataloged, staged and queued
    Queued { file: FileRecord },
    /// Moved to the error area
    Errored { path: PathBuf, reason: String },
    /// Dry run: classified, nothing written
    Planned { description: FileDescription },
}

/// Provenance of a built output.
#[derive(Debug, Clone)]
pub struct BuiltOutput {
    pub product_id: ProductId,
    /// Version assigned by the dispatcher
    pub version: Version,
    pub parents: Vec<FileId>,
    pub code: CodeId,
}

/// Counts from one scan of the incoming area.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub queued: usize,
    pub errored: usize,
    pub planned: usize,
}

impl ImportSummary {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Queued { .. } => self.queued += 1,
            IngestOutcome::Errored { .. } => self.errored += 1,
            IngestOutcome::Planned { .. } => self.planned += 1,
        }
    }
}

pub struct Ingestor<'a> {
    catalog: &'a dyn Catalog,
    registry: &'a InspectorRegistry,
    queue: &'a ProcessQueue<'a>,
    error_dir: PathBuf,
    dry_run: bool,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        registry: &'a InspectorRegistry,
        queue: &'a ProcessQueue<'a>,
        error_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            registry,
            queue,
            error_dir: error_dir.into(),
            dry_run: queue.is_dry_run(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn error_dir(&self) -> &Path {
        &self.error_dir
    }

    /// Every active inspector registration, paired with its product.
    pub fn candidates(&self) -> IngestResult<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for registration in self.catalog.active_inspectors()? {
            let Some(product) = self.catalog.product(registration.product_id)? else {
                tracing::warn!(
                    inspector = %registration.name,
                    product_id = registration.product_id,
                    "inspector registered for unknown product"
                );
                continue;
            };
            candidates.push(Candidate {
                inspector: registration.name,
                args: registration.arguments,
                product: product_context(self.catalog, &product)?,
            });
        }
        Ok(candidates)
    }

    /// Scan `incoming_dir` and ingest every regular file in it.
    ///
    /// Files are processed in name order under the [`IncomingLock`]. A
    /// failure on one file is logged and counted; only ambiguous claims
    /// abort the scan.
    pub fn import_incoming(
        &self,
        incoming_dir: &Path,
        lock_timeout: Duration,
    ) -> IngestResult<ImportSummary> {
        let mut summary = ImportSummary::default();
        if !incoming_dir.is_dir() {
            if self.dry_run {
                return Ok(summary);
            }
            fs::create_dir_all(incoming_dir).map_err(|source| IngestError::Io {
                path: incoming_dir.to_path_buf(),
                source,
            })?;
        }

        let _lock = if self.dry_run {
            None
        } else {
            Some(IncomingLock::acquire(incoming_dir, lock_timeout)?)
        };

        let candidates = self.candidates()?;
        let entries = WalkDir::new(incoming_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot read incoming entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.')
            {
                continue;
            }

            match self.ingest_with(entry.path(), &candidates) {
                Ok(outcome) => summary.record(&outcome),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(file = %entry.path().display(), error = %e, "ingest failed");
                    summary.errored += 1;
                }
            }
        }

        tracing::info!(
            queued = summary.queued,
            errored = summary.errored,
            planned = summary.planned,
            "incoming scan finished"
        );
        Ok(summary)
    }

    /// Ingest one newly arrived file.
    pub fn ingest_incoming(&self, path: &Path) -> IngestResult<IngestOutcome> {
        let candidates = self.candidates()?;
        self.ingest_with(path, &candidates)
    }

    fn ingest_with(&self, path: &Path, candidates: &[Candidate]) -> IngestResult<IngestOutcome> {
        let mut lifecycle = Lifecycle::incoming(display_name(path));
        let _span = tracing::info_span!("ingest", file = %lifecycle.subject()).entered();

        let Some(description) = self.registry.classify(path, candidates)? else {
            return self.reject(path, &mut lifecycle, "no inspector claimed the file");
        };
        lifecycle.advance(FileState::Classified)?;

        if self.dry_run {
            tracing::info!(product_id = description.product_id, version = %description.version, "would catalog");
            return Ok(IngestOutcome::Planned { description });
        }

        let file = match self.catalog_and_stage(path, NewFile::from(description), &mut lifecycle) {
            Ok(file) => file,
            Err(e @ (CatalogError::Integrity(_) | CatalogError::Staging(_))) => {
                return self.reject(path, &mut lifecycle, &e.to_string());
            }
            Err(e) => return Err(e.into()),
        };

        self.enqueue(&file, &mut lifecycle)?;
        tracing::info!(file_id = file.file_id, newest = file.newest_version, "ingested");
        Ok(IngestOutcome::Queued { file })
    }

    /// Catalog a successful build output and queue it.
    ///
    /// The output is classified like any arrival but must be recognised as
    /// `built.product_id`; the version the dispatcher assigned wins over
    /// whatever the inspector read. An output that cannot be cataloged is
    /// moved to the error area before the error is returned.
    pub fn ingest_built(&self, path: &Path, built: BuiltOutput) -> IngestResult<FileRecord> {
        let mut lifecycle = Lifecycle::starting_at(display_name(path), FileState::Built);
        let _span = tracing::info_span!("ingest_built", file = %lifecycle.subject()).entered();
        lifecycle.advance(FileState::Incoming)?;

        let error = match self.catalog_built(path, built, &mut lifecycle) {
            Ok(file) => return Ok(file),
            Err(e) => e,
        };
        // once staged the output is cataloged and no longer at `path`
        if lifecycle.state().can_transition_to(FileState::Errored) {
            lifecycle.advance(FileState::Errored)?;
            tracing::warn!(error = %error, "build output rejected");
            if path.exists() {
                if let Err(e) = self.move_to_error(path) {
                    tracing::error!(error = %e, "cannot move build output to error area");
                }
            }
        }
        Err(error)
    }

    fn catalog_built(
        &self,
        path: &Path,
        built: BuiltOutput,
        lifecycle: &mut Lifecycle,
    ) -> IngestResult<FileRecord> {
        let candidates = self.candidates()?;
        let Some(mut description) = self.registry.classify(path, &candidates)? else {
            return Err(IngestError::Unclaimed(path.to_path_buf()));
        };
        if description.product_id != built.product_id {
            return Err(IngestError::ProductMismatch {
                path: path.to_path_buf(),
                expected: built.product_id,
                found: description.product_id,
            });
        }
        if description.version != built.version {
            tracing::debug!(
                inspected = %description.version,
                assigned = %built.version,
                "overriding inspected version"
            );
            description.version = built.version;
        }
        lifecycle.advance(FileState::Classified)?;

        let new = NewFile {
            description,
            parents: built.parents,
            code: Some(built.code),
        };
        let file = self.catalog_and_stage(path, new, lifecycle)?;
        self.enqueue(&file, lifecycle)?;
        tracing::info!(file_id = file.file_id, "build output cataloged");
        Ok(file)
    }

    fn catalog_and_stage(
        &self,
        source: &Path,
        new: NewFile,
        lifecycle: &mut Lifecycle,
    ) -> Result<FileRecord, CatalogError> {
        // computed up front: the staging callback cannot use the catalog
        let destination = self.canonical_path(&new.description)?;

        let mut stage = |_: &FileRecord| -> Result<(), CatalogError> {
            lifecycle
                .advance(FileState::Cataloged)
                .map_err(|e| CatalogError::Staging(e.to_string()))?;
            move_file(source, &destination).map_err(|e| {
                CatalogError::Staging(format!(
                    "cannot move {} to {}: {}",
                    source.display(),
                    destination.display(),
                    e
                ))
            })
        };
        let file = self.catalog.insert_file(&new, &mut stage)?;
        lifecycle
            .advance(FileState::Staged)
            .map_err(|e| CatalogError::Staging(e.to_string()))?;
        Ok(file)
    }

    fn enqueue(&self, file: &FileRecord, lifecycle: &mut Lifecycle) -> IngestResult<()> {
        self.queue.push(&[FileSelector::Id(file.file_id)], None)?;
        lifecycle.advance(FileState::Queued)?;
        Ok(())
    }

    /// Where a described file lives once cataloged.
    pub fn canonical_path(&self, description: &FileDescription) -> Result<PathBuf, CatalogError> {
        let product = require_product(self.catalog, description.product_id)?;
        let context = TemplateContext {
            keyword: description.process_keyword.clone(),
            ..Default::default()
        }
        .with_date(description.utc_file_date)
        .with_start_time(description.utc_start_time)
        .with_version(description.version);
        Ok(product_dir(self.catalog, &product, context)?.join(&description.filename))
    }

    fn reject(
        &self,
        path: &Path,
        lifecycle: &mut Lifecycle,
        reason: &str,
    ) -> IngestResult<IngestOutcome> {
        lifecycle.advance(FileState::Errored)?;
        tracing::warn!(reason, "rejecting file");
        let path = if self.dry_run {
            path.to_path_buf()
        } else {
            match self.move_to_error(path) {
                Ok(moved) => moved,
                Err(e) => {
                    tracing::error!(error = %e, "cannot move file to error area");
                    path.to_path_buf()
                }
            }
        };
        Ok(IngestOutcome::Errored {
            path,
            reason: reason.to_string(),
        })
    }

    /// Move `path` into the error area, replacing a file of the same name.
    pub fn move_to_error(&self, path: &Path) -> IngestResult<PathBuf> {
        let io_err = |source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        };
        let name = path
            .file_name()
            .ok_or_else(|| io_err(io::Error::new(io::ErrorKind::InvalidInput, "no file name")))?;
        let destination = self.error_dir.join(name);
        if destination.exists() {
            fs::remove_file(&destination).map_err(io_err)?;
        }
        move_file(path, &destination).map_err(io_err)?;
        tracing::info!(to = %destination.display(), "moved to error area");
        Ok(destination)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
