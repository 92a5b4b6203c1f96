//! Dependency resolver
//!
//! Turns a cataloged file into build directives for the processes that
//! consume its product. For every child process and every date the file
//! covers, input files are gathered according to the process timebase:
//!
//! - FILE: the newest file of each input product dated exactly that day,
//!   restricted to the triggering file's process keyword
//! - DAILY: every newest file of each input product covering the day
//! - RUN: like FILE without the keyword filter, resolved once per cycle
//!
//! A date with a required input missing is skipped; there are no partial
//! builds.

mod directive;

use std::cell::RefCell;
use std::collections::HashSet;

use chrono::NaiveDate;
use thiserror::Error;

use dbflow_model::{FileId, Timebase, VersionPart};

use crate::catalog::{Catalog, CatalogError, FileRecord, FileSelector, ProcessRecord, QueueEntry};
use crate::guard::ConcurrencyGuard;
use crate::queue::{ProcessQueue, QueueError};

pub use directive::{BuildDirective, PendingDirectives};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

pub struct DependencyResolver<'a> {
    catalog: &'a dyn Catalog,
    guard: &'a ConcurrencyGuard<'a>,
    queue: &'a ProcessQueue<'a>,
    /// Inputs of builds whose process was running elsewhere
    held_back: RefCell<Vec<QueueEntry>>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        guard: &'a ConcurrencyGuard<'a>,
        queue: &'a ProcessQueue<'a>,
    ) -> Self {
        Self {
            catalog,
            guard,
            queue,
            held_back: RefCell::new(Vec::new()),
        }
    }

    /// Take the queue entries held back because their process was running.
    ///
    /// Their queue entries were already consumed, so the caller re-queues
    /// them once the cycle is done.
    pub fn take_held_back(&self) -> Vec<QueueEntry> {
        std::mem::take(&mut *self.held_back.borrow_mut())
    }

    /// Resolve the builds `file` enables and add them to `pending`.
    ///
    /// Returns the directives accepted by this call.
    pub fn resolve(
        &self,
        file: &FileRecord,
        bump: Option<VersionPart>,
        pending: &mut PendingDirectives,
    ) -> ResolveResult<Vec<BuildDirective>> {
        let _span = tracing::debug_span!("resolve", file = %file.filename).entered();
        let mut accepted = Vec::new();

        for process in self.catalog.child_processes(file.product_id)? {
            if process.output_timebase == Timebase::Run {
                // RUN processes are resolved once per cycle
                continue;
            }
            for date in file.dates() {
                let keyword = match process.output_timebase {
                    Timebase::File => Some(file.process_keyword.as_deref()),
                    _ => None,
                };
                if let Some(directive) =
                    self.resolve_one(&process, date, keyword, bump, pending)?
                {
                    accepted.push(directive);
                }
            }
        }
        Ok(accepted)
    }

    /// Resolve every RUN-timebase process for `date`.
    pub fn resolve_run_processes(
        &self,
        date: NaiveDate,
        pending: &mut PendingDirectives,
    ) -> ResolveResult<Vec<BuildDirective>> {
        let mut accepted = Vec::new();
        for process in self.catalog.processes_by_timebase(Timebase::Run)? {
            if let Some(directive) = self.resolve_one(&process, date, None, None, pending)? {
                accepted.push(directive);
            }
        }
        Ok(accepted)
    }

    /// `keyword` is `Some` only for FILE processes: the keyword every input
    /// must carry (`Some(None)` meaning "no keyword").
    fn resolve_one(
        &self,
        process: &ProcessRecord,
        date: NaiveDate,
        keyword: Option<Option<&str>>,
        bump: Option<VersionPart>,
        pending: &mut PendingDirectives,
    ) -> ResolveResult<Option<BuildDirective>> {
        let Some(inputs) = self.gather_inputs(process, date, keyword)? else {
            return Ok(None);
        };

        if inputs.len() > 1 {
            let selectors: Vec<FileSelector> = inputs.iter().map(|id| FileSelector::Id(*id)).collect();
            let removed = self.queue.remove(&selectors)?;
            if removed > 0 {
                tracing::debug!(process = %process.process_name, removed, "inputs consumed from queue");
            }
        }

        if self.guard.is_running(process.process_id)? {
            tracing::info!(process = %process.process_name, %date, "process running elsewhere, holding back");
            self.held_back
                .borrow_mut()
                .extend(inputs.iter().map(|id| QueueEntry::new(*id, bump)));
            return Ok(None);
        }

        if process.output_timebase == Timebase::Daily
            && pending.has_process_date(process.process_id, date)
        {
            tracing::debug!(process = %process.process_name, %date, "daily build already pending");
            return Ok(None);
        }

        let directive = BuildDirective {
            process_id: process.process_id,
            date,
            inputs,
            process_keyword: keyword.flatten().map(str::to_string),
            version_bump: bump,
        };

        if !self.is_runnable(&directive)? {
            return Ok(None);
        }
        if !pending.insert(directive.clone()) {
            return Ok(None);
        }
        tracing::info!(process = %process.process_name, %directive, "build resolved");
        Ok(Some(directive))
    }

    /// Input file ids in process-input order, or `None` when a required
    /// input has no candidate.
    fn gather_inputs(
        &self,
        process: &ProcessRecord,
        date: NaiveDate,
        keyword: Option<Option<&str>>,
    ) -> ResolveResult<Option<Vec<FileId>>> {
        let mut inputs = Vec::new();

        for input in self.catalog.process_inputs(process.process_id)? {
            let candidates: Vec<FileRecord> = match process.output_timebase {
                Timebase::Daily => self.catalog.newest_files_covering(input.product_id, date)?,
                Timebase::File | Timebase::Run => {
                    let files = self.catalog.newest_files_on(input.product_id, date)?;
                    let files = files.into_iter().filter(|f| match keyword {
                        Some(wanted) => f.process_keyword.as_deref() == wanted,
                        None => true,
                    });
                    // one file per input product
                    files
                        .max_by_key(|f| (f.version, f.file_id))
                        .into_iter()
                        .collect()
                }
            };

            if candidates.is_empty() {
                if input.optional {
                    continue;
                }
                tracing::debug!(
                    process = %process.process_name,
                    %date,
                    product = input.product_id,
                    "required input missing"
                );
                return Ok(None);
            }
            inputs.extend(candidates.into_iter().map(|f| f.file_id));
        }

        if inputs.is_empty() {
            return Ok(None);
        }
        Ok(Some(inputs))
    }

    /// Whether a directive can be built now: an active code covers the
    /// date, every input is still the newest version and on disk, and the
    /// output is not already current (unless a version bump was asked for).
    pub fn is_runnable(&self, directive: &BuildDirective) -> ResolveResult<bool> {
        let Some(code) = self
            .catalog
            .active_code(directive.process_id, directive.date)?
        else {
            tracing::debug!(%directive, "no active code");
            return Ok(false);
        };

        for id in &directive.inputs {
            match self.catalog.file(*id)? {
                Some(f) if f.newest_version && f.exists_on_disk => {}
                _ => {
                    tracing::debug!(%directive, input = id, "input superseded or missing");
                    return Ok(false);
                }
            }
        }

        if directive.version_bump.is_some() {
            return Ok(true);
        }

        let Some(process) = self.catalog.process(directive.process_id)? else {
            return Ok(false);
        };
        let wanted: HashSet<FileId> = directive.inputs.iter().copied().collect();
        for output in self
            .catalog
            .newest_files_on(process.output_product, directive.date)?
        {
            let parents: HashSet<FileId> =
                self.catalog.file_parents(output.file_id)?.into_iter().collect();
            if parents == wanted && self.catalog.file_code(output.file_id)? == Some(code.code_id) {
                tracing::debug!(%directive, output = %output.filename, "output up to date");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
