//! Build executable invocation.
//!
//! The scheduler hands an [`Executor`] a resolved [`BuildRequest`]: program
//! path, ordered input paths, output path and already-substituted extra
//! arguments. The executor runs it and reports a [`BuildOutcome`]; it knows
//! nothing about the catalog.

mod command;
pub mod timeout;

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::{CommandExecutor, ExecutorConfig};
pub use timeout::{TimeoutConfig, TimeoutEnforcer, TimeoutStatus, TimeoutValidationError};

/// Environment variables passed through to build programs; everything
/// else is dropped.
pub const ENV_ALLOWLIST: &[&str] = &[
    "HOME", "PATH", "TMPDIR", "LANG", "LC_ALL", "LC_CTYPE", "TZ", "USER", "LOGNAME",
];

/// Errors from executor operations.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("build program not found: {0}")]
    ProgramNotFound(PathBuf),

    #[error("build program failed to start: {0}")]
    SpawnFailed(String),

    #[error("invalid timeout configuration: {0}")]
    InvalidTimeouts(#[from] TimeoutValidationError),
}

/// Result type for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// One build invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub program: PathBuf,
    /// Extra arguments, placed before the inputs
    pub extra_args: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    /// Working directory; the output's directory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// Where to capture stdout/stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl BuildRequest {
    pub fn new(program: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            inputs: Vec::new(),
            output: output.into(),
            work_dir: None,
            log_path: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    pub fn with_log_path(mut self, log_path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    /// Arguments after the program: extra arguments, inputs, then output.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.extra_args.clone();
        argv.extend(self.inputs.iter().map(|p| p.to_string_lossy().into_owned()));
        argv.push(self.output.to_string_lossy().into_owned());
        argv
    }

    /// Directory the program runs in.
    pub fn effective_work_dir(&self) -> &Path {
        match &self.work_dir {
            Some(dir) => dir,
            None => self.output.parent().unwrap_or_else(|| Path::new(".")),
        }
    }
}

/// How a build ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

/// Result of a build invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Terminating signal, if the program was killed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_signal: Option<String>,
    pub duration_ms: u64,
}

impl BuildOutcome {
    pub fn success(duration_ms: u64) -> Self {
        Self {
            status: BuildStatus::Success,
            exit_code: Some(0),
            term_signal: None,
            duration_ms,
        }
    }

    pub fn failed(exit_code: Option<i32>, duration_ms: u64) -> Self {
        Self {
            status: BuildStatus::Failed,
            exit_code,
            term_signal: None,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }
}

/// Capability that runs build programs.
pub trait Executor {
    fn run(&self, request: &BuildRequest) -> ExecutorResult<BuildOutcome>;
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn run(&self, request: &BuildRequest) -> ExecutorResult<BuildOutcome> {
        (**self).run(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_order() {
        let request = BuildRequest::new("/codes/l1.py", "/tmp/out.cdf")
            .with_extra_args(vec!["-d".into(), "20130904".into()])
            .with_inputs(vec!["/data/a.cdf".into(), "/data/b.cdf".into()]);

        assert_eq!(
            request.argv(),
            vec!["-d", "20130904", "/data/a.cdf", "/data/b.cdf", "/tmp/out.cdf"]
        );
    }

    #[test]
    fn test_work_dir_defaults_to_output_dir() {
        let request = BuildRequest::new("/codes/l1.py", "/tmp/build/out.cdf");
        assert_eq!(request.effective_work_dir(), Path::new("/tmp/build"));
    }

    #[test]
    fn test_outcome_constructors() {
        assert!(BuildOutcome::success(10).is_success());
        let failed = BuildOutcome::failed(Some(2), 15);
        assert!(!failed.is_success());
        assert_eq!(failed.exit_code, Some(2));
    }

    #[test]
    fn test_env_allowlist_has_path() {
        assert!(ENV_ALLOWLIST.contains(&"PATH"));
        assert!(!ENV_ALLOWLIST.contains(&"LD_PRELOAD"));
    }
}
