//! File inspectors.
//!
//! An inspector looks at a raw file and decides whether it is an instance
//! of a given product. The [`InspectorRegistry`] holds every inspector the
//! binary knows about, keyed by the name the catalog refers to, and runs
//! the catalog's active inspectors against incoming files.

mod description;
mod digest;
mod kwargs;
mod registry;
mod template;

use std::path::Path;

pub use description::{FileDescription, Inspection, ProductContext};
pub use digest::{file_digest, DIGEST_BUFFER_SIZE};
pub use kwargs::{parse_kwargs, Kwargs};
pub use registry::{Candidate, ClaimPolicy, ClassifyError, InspectorRegistry};
pub use template::{extract_yyyymmdd, TemplateInspector};

/// Errors an inspector may raise.
///
/// The registry never propagates these: an erroring inspector is treated
/// as one that did not match.
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad inspector argument: {0}")]
    BadArgument(String),

    #[error("format error: {0}")]
    Format(#[from] dbflow_model::FormatError),

    #[error("{0}")]
    Other(String),
}

/// Capability every inspector implements.
pub trait Inspector: Send + Sync {
    /// Inspect `path` as a candidate instance of `product`.
    ///
    /// Returns `Ok(None)` when the file is not this product.
    fn inspect(
        &self,
        path: &Path,
        product: &ProductContext,
        args: &Kwargs,
    ) -> Result<Option<Inspection>, InspectError>;
}

impl<F> Inspector for F
where
    F: Fn(&Path, &ProductContext, &Kwargs) -> Result<Option<Inspection>, InspectError>
        + Send
        + Sync,
{
    fn inspect(
        &self,
        path: &Path,
        product: &ProductContext,
        args: &Kwargs,
    ) -> Result<Option<Inspection>, InspectError> {
        self(path, product, args)
    }
}
