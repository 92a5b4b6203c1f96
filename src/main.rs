//! dbflow CLI
//!
//! Entry point for the `dbflow` command-line tool.

use std::path::PathBuf;
use std::process;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use dbflow::catalog::{CatalogRef, CatalogSeed, FileSelector, SqliteCatalog};
use dbflow::config::{default_user_config_path, EffectiveConfig, Settings};
use dbflow::guard::{ConcurrencyGuard, LeaseOwner};
use dbflow::pipeline::{CycleReport, PipelineError, PipelineResult, Scheduler, SchedulerConfig};
use dbflow::queue::ProcessQueue;
use dbflow::reprocess::{ReprocessScope, Reprocessor};
use dbflow::signal::SignalHandler;
use dbflow::{logging, Catalog};
use dbflow_executor::CommandExecutor;
use dbflow_inspector::InspectorRegistry;
use dbflow_model::{parse_date, DateRange, VersionPart};

#[derive(Parser)]
#[command(name = "dbflow")]
#[command(about = "Dependency-driven build scheduler for instrument data", version)]
struct Cli {
    /// Configuration file layered over ~/.config/dbflow/config.toml
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Catalog database (overrides catalog.path)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Report what would happen without changing anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log filter, e.g. "debug" or "dbflow=trace" (RUST_LOG wins)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the catalog, optionally loading reference data
    Init {
        /// TOML file with mission, instruments, products, processes, codes, inspectors
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Run one scheduling cycle
    Run {
        /// Print the cycle report as JSON
        #[arg(long)]
        json: bool,

        /// Date RUN-timebase processes are built for (default: today)
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },

    /// Inspect or edit the process queue
    Queue {
        #[command(subcommand)]
        action: QueueCommands,
    },

    /// Re-queue cataloged files so their dependants are rebuilt
    Reprocess {
        #[command(subcommand)]
        target: ReprocessCommands,
    },

    /// Process leases
    Lease {
        #[command(subcommand)]
        action: LeaseCommands,
    },

    /// Print the effective configuration and its sources
    Config,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued files
    List {
        #[arg(long)]
        json: bool,
    },
    /// Number of queued files
    Len,
    /// Queue files by id or name, skipping unknown and already queued ones
    Push {
        #[arg(required = true)]
        files: Vec<FileSelector>,
        /// Version component to bump on resulting outputs
        #[arg(long)]
        bump: Option<VersionPart>,
    },
    /// Queue file ids without checking the catalog
    Rawadd {
        #[arg(required = true)]
        ids: Vec<i64>,
        #[arg(long)]
        bump: Option<VersionPart>,
    },
    /// Remove files by id or name
    Remove {
        #[arg(required = true)]
        files: Vec<FileSelector>,
    },
    /// Remove and print the entry at INDEX (negative counts from the end)
    Pop {
        #[arg(allow_negative_numbers = true, default_value_t = 0)]
        index: isize,
    },
    /// Collapse entries for the same product, date and keyword
    Clean,
    /// Empty the queue
    Flush,
}

#[derive(Args)]
struct ReprocessOpts {
    /// First file date, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    start: Option<NaiveDate>,
    /// Last file date, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    end: Option<NaiveDate>,
    /// Version component to bump: interface, quality, revision (or 0, 1, 2)
    #[arg(long)]
    bump: Option<VersionPart>,
    /// Queue the parents of the selected files, rebuilding the files themselves
    #[arg(long)]
    parents: bool,
}

impl ReprocessOpts {
    fn range(&self) -> PipelineResult<DateRange> {
        DateRange::new(self.start, self.end)
            .map_err(|e| PipelineError::Catalog(dbflow::CatalogError::Format(e)))
    }

    fn scope(&self) -> ReprocessScope {
        if self.parents {
            ReprocessScope::Parents
        } else {
            ReprocessScope::Selected
        }
    }
}

#[derive(Subcommand)]
enum ReprocessCommands {
    /// Files built by a code (id or filename)
    Code {
        code: CatalogRef,
        #[command(flatten)]
        opts: ReprocessOpts,
    },
    /// Files of a product (id or name)
    Product {
        product: CatalogRef,
        #[command(flatten)]
        opts: ReprocessOpts,
    },
    /// Files of every product of an instrument (id or name)
    Instrument {
        instrument: CatalogRef,
        #[arg(long)]
        level: Option<f64>,
        #[command(flatten)]
        opts: ReprocessOpts,
    },
    /// Files in a date range, across products
    Date {
        #[arg(long)]
        level: Option<f64>,
        #[command(flatten)]
        opts: ReprocessOpts,
    },
    /// Every newest file, without a version bump
    All {
        #[arg(long)]
        parents: bool,
    },
}

#[derive(Subcommand)]
enum LeaseCommands {
    /// List leases and whether they are stale
    List {
        #[arg(long)]
        json: bool,
    },
    /// Clear the lease on a process (id or name), whoever holds it
    Reset { process: CatalogRef },
    /// Clear every stale lease
    ResetStale,
}

fn main() {
    let cli = Cli::parse();

    let mut overrides = json!({});
    if let Some(path) = &cli.catalog {
        overrides["catalog"] = json!({ "path": path });
    }
    if let Some(level) = &cli.log_level {
        overrides["logging"] = json!({ "filter": level });
    }

    let effective = match EffectiveConfig::build(
        default_user_config_path().as_deref(),
        cli.config.as_deref(),
        Some(overrides),
    ) {
        Ok(effective) => effective,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(PipelineError::Config(e).exit_code());
        }
    };
    let settings = match effective.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(PipelineError::Config(e).exit_code());
        }
    };
    logging::init(&settings.logging);

    if let Err(e) = run(cli, &effective, &settings) {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn run(cli: Cli, effective: &EffectiveConfig, settings: &Settings) -> PipelineResult<()> {
    if let Commands::Config = cli.command {
        println!("{}", effective.to_json()?);
        return Ok(());
    }

    let catalog = SqliteCatalog::open(&settings.catalog.path, settings.catalog.busy_timeout())?;
    let dry_run = cli.dry_run;

    match cli.command {
        Commands::Init { seed } => run_init(&catalog, settings, seed),
        Commands::Run { json, date } => run_cycle(&catalog, settings, dry_run, json, date),
        Commands::Queue { action } => run_queue(&catalog, settings, dry_run, action),
        Commands::Reprocess { target } => run_reprocess(&catalog, settings, dry_run, target),
        Commands::Lease { action } => run_lease(&catalog, settings, action),
        Commands::Config => Ok(()),
    }
}

fn run_init(catalog: &SqliteCatalog, settings: &Settings, seed: Option<PathBuf>) -> PipelineResult<()> {
    if let Some(path) = seed {
        CatalogSeed::load(&path)?.apply(catalog)?;
        println!("Loaded {}", path.display());
    }
    println!("Catalog ready: {}", settings.catalog.path.display());
    Ok(())
}

fn run_cycle(
    catalog: &SqliteCatalog,
    settings: &Settings,
    dry_run: bool,
    json: bool,
    date: Option<NaiveDate>,
) -> PipelineResult<()> {
    let signals = SignalHandler::new();
    if let Err(e) = signals.install() {
        tracing::warn!(error = %e, "cannot install signal handler");
    }
    let stop = signals.state().stop_flag();

    let registry = InspectorRegistry::with_builtins().with_policy(settings.inspection.claim_policy);
    let executor = CommandExecutor::new(settings.executor.to_executor_config())?
        .with_cancellation_flag(stop.clone());

    let mission = catalog.mission()?;
    let mut config = SchedulerConfig::from_settings(settings, &mission, dry_run);
    if let Some(date) = date {
        config.run_date = date;
    }

    let report = Scheduler::new(catalog, &registry, &executor, config)
        .with_stop_flag(stop)
        .run_cycle()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.stopped {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    if report.dry_run {
        println!("Dry run: nothing was changed");
    }
    println!(
        "Incoming: {} queued, {} errored",
        report.import.queued, report.import.errored
    );
    println!(
        "Resolved {} file(s) into {} directive(s)",
        report.resolved_files,
        report.directives.len()
    );
    if report.dropped > 0 {
        println!("Dropped {} unknown queue entr(ies)", report.dropped);
    }
    println!(
        "Builds: {} built, {} failed, {} skipped",
        report.built, report.failed, report.skipped
    );
    if report.requeued > 0 {
        println!("Re-queued {} input(s) for the next cycle", report.requeued);
    }
    for plan in &report.plans {
        println!(
            "  would run {} -> {}",
            plan.process_name,
            plan.output.display()
        );
    }
}

fn run_queue(
    catalog: &SqliteCatalog,
    settings: &Settings,
    dry_run: bool,
    action: QueueCommands,
) -> PipelineResult<()> {
    let queue = ProcessQueue::new(catalog)
        .with_dry_run(dry_run)
        .with_batch_size(settings.scheduler.max_add);

    match action {
        QueueCommands::List { json } => {
            let entries = queue.get_all_with_bump()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            for entry in entries {
                let name = catalog
                    .file(entry.file_id)?
                    .map(|f| f.filename)
                    .unwrap_or_else(|| "<not in catalog>".to_string());
                match entry.version_bump {
                    Some(part) => println!("{}\t{}\tbump {}", entry.file_id, name, part),
                    None => println!("{}\t{}", entry.file_id, name),
                }
            }
        }
        QueueCommands::Len => println!("{}", queue.len()?),
        QueueCommands::Push { files, bump } => {
            let added = queue.push(&files, bump)?;
            println!("Queued {} of {} file(s)", added.len(), files.len());
        }
        QueueCommands::Rawadd { ids, bump } => {
            println!("Queued {} file(s)", queue.rawadd(&ids, bump)?);
        }
        QueueCommands::Remove { files } => {
            println!("Removed {} file(s)", queue.remove(&files)?);
        }
        QueueCommands::Pop { index } => println!("{}", queue.pop(index)?),
        QueueCommands::Clean => println!("Removed {} duplicate(s)", queue.clean()?),
        QueueCommands::Flush => println!("Removed {} file(s)", queue.flush()?),
    }
    Ok(())
}

fn run_reprocess(
    catalog: &SqliteCatalog,
    settings: &Settings,
    dry_run: bool,
    target: ReprocessCommands,
) -> PipelineResult<()> {
    let queue = ProcessQueue::new(catalog)
        .with_dry_run(dry_run)
        .with_batch_size(settings.scheduler.max_add);
    let reprocessor = |scope: ReprocessScope| Reprocessor::new(catalog, &queue).with_scope(scope);

    let added = match target {
        ReprocessCommands::Code { code, opts } => {
            reprocessor(opts.scope()).by_code(&code, opts.range()?, opts.bump)?
        }
        ReprocessCommands::Product { product, opts } => {
            reprocessor(opts.scope()).by_product(&product, opts.range()?, opts.bump)?
        }
        ReprocessCommands::Instrument {
            instrument,
            level,
            opts,
        } => reprocessor(opts.scope()).by_instrument(&instrument, level, opts.range()?, opts.bump)?,
        ReprocessCommands::Date { level, opts } => {
            reprocessor(opts.scope()).by_date(opts.range()?, level, opts.bump)?
        }
        ReprocessCommands::All { parents } => {
            let scope = if parents {
                ReprocessScope::Parents
            } else {
                ReprocessScope::Selected
            };
            reprocessor(scope).all()?
        }
    };
    println!("Queued {} file(s)", added);
    Ok(())
}

fn run_lease(catalog: &SqliteCatalog, settings: &Settings, action: LeaseCommands) -> PipelineResult<()> {
    let guard = ConcurrencyGuard::new(
        catalog,
        LeaseOwner::current(),
        settings.scheduler.lease_stale_after(),
    );

    match action {
        LeaseCommands::List { json } => {
            let leases = guard.leases()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&leases)?);
                return Ok(());
            }
            for status in leases {
                let lease = &status.lease;
                println!(
                    "{}\t{}\tpid {} on {}\tsince {}{}",
                    lease.scope,
                    lease.owner_id,
                    lease.pid,
                    lease.hostname,
                    lease.started_at,
                    if status.stale { "\tSTALE" } else { "" }
                );
            }
        }
        LeaseCommands::Reset { process } => {
            let record = match &process {
                CatalogRef::Id(id) => catalog.process(*id)?,
                CatalogRef::Name(name) => catalog.process_by_name(name)?,
            }
            .ok_or_else(|| dbflow::CatalogError::not_found("process", &process))?;
            if guard.reset(record.process_id)? {
                println!("Cleared lease on {}", record.process_name);
            } else {
                println!("No lease on {}", record.process_name);
            }
        }
        LeaseCommands::ResetStale => println!("Cleared {} stale lease(s)", guard.reset_stale()?),
    }
    Ok(())
}
