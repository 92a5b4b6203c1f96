//! Shared value types for the dbflow scheduler.
//!
//! Everything in here is plain data: versions, timebases, identifiers,
//! date ranges and filename templates. Nothing touches the catalog or
//! the filesystem.

pub mod dates;
mod error;
pub mod template;
mod timebase;
mod version;

pub use dates::{expand_dates, parse_date, DateRange};
pub use error::FormatError;
pub use template::TemplateContext;
pub use timebase::Timebase;
pub use version::{Version, VersionPart};

/// Catalog identity of a file.
pub type FileId = i64;
/// Catalog identity of a product.
pub type ProductId = i64;
/// Catalog identity of a process.
pub type ProcessId = i64;
/// Catalog identity of a code.
pub type CodeId = i64;
/// Catalog identity of an instrument.
pub type InstrumentId = i64;
