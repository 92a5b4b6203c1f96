//! Catalog access.
//!
//! The scheduler only talks to the catalog through the [`Catalog`] trait.
//! [`SqliteCatalog`] is the implementation shipped with the binary.
//!
//! "No such row" is `Ok(None)` or an empty `Vec`; errors are reserved for
//! storage failures and constraint violations.

mod records;
mod seed;
mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use dbflow_inspector::ProductContext;
use dbflow_model::{
    CodeId, FileId, FormatError, InstrumentId, ProcessId, ProductId, TemplateContext, Timebase,
};

pub use records::{
    CatalogRef, CodeRecord, FileFilter, FileRecord, FileSelector, InspectorRecord,
    InstrumentRecord, LeaseRecord, MissionRecord, NewFile, ProcessInput, ProcessRecord,
    ProductRecord, QueueEntry,
};
pub use seed::{CatalogSeed, SeedError};
pub use sqlite::{NewCode, NewProcess, NewProduct, SqliteCatalog};

/// Catalog result type
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors from catalog operations
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("staging failed: {0}")]
    Staging(String),

    #[error("catalog connection poisoned")]
    Poisoned,
}

impl CatalogError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        CatalogError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, CatalogError::Integrity(_))
    }

    /// The store itself failed, as opposed to one row or file.
    pub fn is_storage(&self) -> bool {
        matches!(self, CatalogError::Sqlite(_) | CatalogError::Poisoned)
    }
}

impl From<rusqlite::Error> for CatalogError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CatalogError::Integrity(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            _ => CatalogError::Sqlite(e),
        }
    }
}

/// Staging callback run inside [`Catalog::insert_file`]'s transaction.
///
/// It must not call back into the catalog.
pub type StageFn<'a> = dyn FnMut(&FileRecord) -> CatalogResult<()> + 'a;

/// Query/command interface the scheduler consumes.
pub trait Catalog {
    // --- reference data ---

    fn mission(&self) -> CatalogResult<MissionRecord>;
    fn instrument(&self, id: InstrumentId) -> CatalogResult<Option<InstrumentRecord>>;
    fn instrument_by_name(&self, name: &str) -> CatalogResult<Option<InstrumentRecord>>;
    fn product(&self, id: ProductId) -> CatalogResult<Option<ProductRecord>>;
    fn product_by_name(&self, name: &str) -> CatalogResult<Option<ProductRecord>>;
    /// Products of an instrument, optionally restricted to one level.
    fn instrument_products(
        &self,
        id: InstrumentId,
        level: Option<f64>,
    ) -> CatalogResult<Vec<ProductRecord>>;
    fn process(&self, id: ProcessId) -> CatalogResult<Option<ProcessRecord>>;
    fn process_by_name(&self, name: &str) -> CatalogResult<Option<ProcessRecord>>;
    fn process_inputs(&self, id: ProcessId) -> CatalogResult<Vec<ProcessInput>>;
    /// Processes that list `product` as an input.
    fn child_processes(&self, product: ProductId) -> CatalogResult<Vec<ProcessRecord>>;
    fn processes_by_timebase(&self, timebase: Timebase) -> CatalogResult<Vec<ProcessRecord>>;
    /// Processes that must not build concurrently with `id`.
    fn related_processes(&self, id: ProcessId) -> CatalogResult<Vec<ProcessId>>;
    fn code(&self, id: CodeId) -> CatalogResult<Option<CodeRecord>>;
    fn code_by_name(&self, name: &str) -> CatalogResult<Option<CodeRecord>>;
    /// The active code implementing `process` on `date`.
    fn active_code(&self, process: ProcessId, date: NaiveDate)
        -> CatalogResult<Option<CodeRecord>>;
    fn active_inspectors(&self) -> CatalogResult<Vec<InspectorRecord>>;

    // --- files ---

    fn file(&self, id: FileId) -> CatalogResult<Option<FileRecord>>;
    fn file_by_name(&self, name: &str) -> CatalogResult<Option<FileRecord>>;
    /// Newest-version files of `product` whose file date is `date`.
    fn newest_files_on(&self, product: ProductId, date: NaiveDate)
        -> CatalogResult<Vec<FileRecord>>;
    /// Newest-version files of `product` whose date span covers `date`.
    fn newest_files_covering(
        &self,
        product: ProductId,
        date: NaiveDate,
    ) -> CatalogResult<Vec<FileRecord>>;
    fn select_files(&self, filter: &FileFilter) -> CatalogResult<Vec<FileRecord>>;
    fn file_parents(&self, id: FileId) -> CatalogResult<Vec<FileId>>;
    fn file_code(&self, id: FileId) -> CatalogResult<Option<CodeId>>;
    /// Catalog a file in one transaction.
    ///
    /// Inserts the row and its provenance links, recomputes the newest
    /// version flag for its product, date and keyword, then calls `stage`.
    /// Any failure, including one returned by `stage`, rolls everything back.
    fn insert_file(&self, new: &NewFile, stage: &mut StageFn<'_>) -> CatalogResult<FileRecord>;

    // --- process queue ---

    /// Entries in insertion order.
    fn queue_entries(&self) -> CatalogResult<Vec<QueueEntry>>;
    /// Append entries, skipping ids already queued. Returns how many were added.
    fn queue_append(&self, entries: &[QueueEntry]) -> CatalogResult<usize>;
    fn queue_delete(&self, ids: &[FileId]) -> CatalogResult<usize>;
    fn queue_clear(&self) -> CatalogResult<usize>;

    // --- leases ---

    fn lease(&self, scope: ProcessId) -> CatalogResult<Option<LeaseRecord>>;
    fn leases(&self) -> CatalogResult<Vec<LeaseRecord>>;
    /// Store `lease` if the scope is free (`expected_owner == None`) or
    /// still held by `expected_owner`. Returns whether it was stored.
    fn lease_swap(
        &self,
        scope: ProcessId,
        expected_owner: Option<&str>,
        lease: &LeaseRecord,
    ) -> CatalogResult<bool>;
    /// Drop the lease on `scope`, only if held by `owner` when given.
    fn lease_release(&self, scope: ProcessId, owner: Option<&str>) -> CatalogResult<bool>;
}

/// Look up a file or fail with `NotFound`.
pub fn require_file(catalog: &dyn Catalog, id: FileId) -> CatalogResult<FileRecord> {
    catalog
        .file(id)?
        .ok_or_else(|| CatalogError::not_found("file", id))
}

/// Look up a product or fail with `NotFound`.
pub fn require_product(catalog: &dyn Catalog, id: ProductId) -> CatalogResult<ProductRecord> {
    catalog
        .product(id)?
        .ok_or_else(|| CatalogError::not_found("product", id))
}

/// Resolve a selector to a cataloged file.
pub fn resolve_file(
    catalog: &dyn Catalog,
    selector: &FileSelector,
) -> CatalogResult<Option<FileRecord>> {
    match selector {
        FileSelector::Id(id) => catalog.file(*id),
        FileSelector::Name(name) => catalog.file_by_name(name),
    }
}

/// What inspectors see of a product.
pub fn product_context(
    catalog: &dyn Catalog,
    product: &ProductRecord,
) -> CatalogResult<ProductContext> {
    let mission = catalog.mission()?;
    let instrument = catalog
        .instrument(product.instrument_id)?
        .ok_or_else(|| CatalogError::not_found("instrument", product.instrument_id))?;
    Ok(ProductContext {
        product_id: product.product_id,
        product_name: product.product_name.clone(),
        level: product.level,
        format: product.format.clone(),
        instrument: instrument.instrument_name,
        satellite: instrument.satellite_name,
        mission: mission.mission_name,
    })
}

/// Directory a file of `product` lives in for the given date.
pub fn product_dir(
    catalog: &dyn Catalog,
    product: &ProductRecord,
    context: TemplateContext,
) -> CatalogResult<PathBuf> {
    let mission = catalog.mission()?;
    let names = product_context(catalog, product)?;
    let context = TemplateContext {
        instrument: Some(names.instrument),
        satellite: Some(names.satellite),
        mission: Some(names.mission),
        product: Some(names.product_name),
        ..context
    };
    let relative = context.render(&product.relative_path)?;
    Ok(PathBuf::from(mission.rootdir).join(relative))
}

/// Canonical on-disk location of a cataloged file.
pub fn file_path(catalog: &dyn Catalog, file: &FileRecord) -> CatalogResult<PathBuf> {
    let product = require_product(catalog, file.product_id)?;
    let context = TemplateContext {
        keyword: file.process_keyword.clone(),
        ..Default::default()
    }
    .with_date(file.utc_file_date)
    .with_start_time(file.utc_start_time)
    .with_version(file.version);
    Ok(product_dir(catalog, &product, context)?.join(&file.filename))
}

/// Absolute path of a code's executable.
pub fn code_path(catalog: &dyn Catalog, code: &CodeRecord) -> CatalogResult<PathBuf> {
    let mission = catalog.mission()?;
    Ok(PathBuf::from(mission.rootdir)
        .join(&code.relative_path)
        .join(&code.filename))
}
