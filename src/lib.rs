//! dbflow - dependency-driven build scheduler for instrument data
//!
//! Newly arrived files are classified against known products, cataloged,
//! and queued. Each queued file is resolved into build directives for the
//! processes that consume it; directives are dispatched to external build
//! programs whose outputs re-enter the queue until nothing is left to do.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod guard;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod reprocess;
pub mod resolver;
pub mod signal;
pub mod state;

pub use catalog::{Catalog, CatalogError, CatalogResult, FileSelector, SqliteCatalog};
pub use dispatch::{BuildDispatcher, BuildPlan, DispatchError, DispatchOutcome};
pub use guard::{ConcurrencyGuard, LeaseGuard, LeaseOwner};
pub use ingest::{IngestError, IngestOutcome, Ingestor};
pub use pipeline::{CycleReport, PipelineError, PipelineResult, Scheduler, SchedulerConfig};
pub use queue::{ProcessQueue, QueueError};
pub use reprocess::{ReprocessScope, Reprocessor};
pub use resolver::{BuildDirective, DependencyResolver, PendingDirectives};
pub use state::{FileState, Lifecycle};
