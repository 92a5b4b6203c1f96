//! Shared fixtures for integration tests
//!
//! A three-level mission (l0 -> l1 -> l2) seeded into an on-disk catalog
//! under a temporary root, plus an executor that copies its first input.

#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::TempDir;

use dbflow::catalog::{CatalogSeed, SqliteCatalog};
use dbflow::{Catalog, SchedulerConfig};
use dbflow_executor::{BuildOutcome, BuildRequest, Executor, ExecutorResult};
use dbflow_model::ProductId;

const SEED: &str = r#"
[mission]
mission_name = "testmission"
rootdir = "{ROOT}"

[[instrument]]
name = "mag"
satellite = "sat1"

[[product]]
name = "mag_l0"
instrument = "mag"
level = 0.0
format = "mag_l0_{Y}{m}{d}_v{VERSION}.dat"
relative_path = "mag/l0"

[[product]]
name = "mag_l1"
instrument = "mag"
level = 1.0
format = "mag_l1_{Y}{m}{d}_v{VERSION}.dat"
relative_path = "mag/l1/{Y}"

[[product]]
name = "mag_l2"
instrument = "mag"
level = 2.0
format = "mag_l2_{Y}{m}{d}_v{VERSION}.dat"
relative_path = "mag/l2"

[[process]]
name = "mag_l0_to_l1"
output_product = "mag_l1"
timebase = "FILE"
inputs = [{ product = "mag_l0" }]

[[process]]
name = "mag_l1_to_l2"
output_product = "mag_l2"
timebase = "FILE"
inputs = [{ product = "mag_l1" }]

[[code]]
process = "mag_l0_to_l1"
filename = "l0_to_l1.sh"
relative_path = "codes"
start = "2000-01-01"
stop = "2099-12-31"
code_version = "1.0.0"
output_version = "1.0.0"

[[code]]
process = "mag_l1_to_l2"
filename = "l1_to_l2.sh"
relative_path = "codes"
start = "2000-01-01"
stop = "2099-12-31"
code_version = "1.0.0"
output_version = "1.0.0"

[[inspector]]
name = "template"
product = "mag_l0"

[[inspector]]
name = "template"
product = "mag_l1"

[[inspector]]
name = "template"
product = "mag_l2"
"#;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// A seeded mission under a temporary root.
pub struct Mission {
    pub root: TempDir,
    pub catalog: SqliteCatalog,
}

impl Mission {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let catalog = Self::open_catalog(root.path());
        let seed = SEED.replace("{ROOT}", root.path().to_str().unwrap());
        CatalogSeed::from_toml_str(&seed)
            .unwrap()
            .apply(&catalog)
            .unwrap();
        Self { root, catalog }
    }

    pub fn open_catalog(root: &Path) -> SqliteCatalog {
        SqliteCatalog::open(root.join("catalog.sqlite"), Duration::from_secs(1)).unwrap()
    }

    /// A second connection to the same catalog file.
    pub fn reopen(&self) -> SqliteCatalog {
        Self::open_catalog(self.root.path())
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    pub fn product_id(&self, name: &str) -> ProductId {
        self.catalog.product_by_name(name).unwrap().unwrap().product_id
    }

    /// Drop a file into the incoming area.
    pub fn arrive(&self, name: &str) -> PathBuf {
        let incoming = self.path("incoming");
        fs::create_dir_all(&incoming).unwrap();
        let path = incoming.join(name);
        fs::write(&path, format!("contents of {}", name)).unwrap();
        path
    }

    pub fn config(&self, dry_run: bool) -> SchedulerConfig {
        SchedulerConfig {
            incoming_dir: self.path("incoming"),
            error_dir: self.path("errors"),
            build_root: self.path("tmp"),
            log_dir: Some(self.path("logs")),
            run_date: date(2020, 1, 2),
            batch_size: 100,
            lease_stale_after: Duration::from_secs(3600),
            lock_timeout: Duration::from_secs(1),
            requeue_failed_inputs: false,
            dry_run,
        }
    }
}

/// Copies the first input to the output, failing for outputs whose name
/// contains `fail_on`.
#[derive(Default)]
pub struct CopyExecutor {
    pub requests: RefCell<Vec<BuildRequest>>,
    pub fail_on: Option<String>,
}

impl CopyExecutor {
    pub fn failing_on(pattern: &str) -> Self {
        Self {
            fail_on: Some(pattern.to_string()),
            ..Default::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl Executor for CopyExecutor {
    fn run(&self, request: &BuildRequest) -> ExecutorResult<BuildOutcome> {
        self.requests.borrow_mut().push(request.clone());
        let name = request.output.to_string_lossy();
        if let Some(pattern) = &self.fail_on {
            if name.contains(pattern.as_str()) {
                return Ok(BuildOutcome::failed(Some(1), 1));
            }
        }
        fs::copy(&request.inputs[0], &request.output)?;
        Ok(BuildOutcome::success(1))
    }
}
