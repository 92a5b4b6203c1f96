//! Subprocess executor.
//!
//! Runs the build program with a cleared environment (allowlist only),
//! streams stdout/stderr into the build log, and enforces the overall and
//! idle timeouts. Timed-out or cancelled builds get SIGTERM, then SIGKILL
//! after the grace period.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::timeout::{TimeoutConfig, TimeoutEnforcer, TimeoutStatus};
use crate::{
    BuildOutcome, BuildRequest, BuildStatus, Executor, ExecutorError, ExecutorResult,
    ENV_ALLOWLIST,
};

/// Poll interval while waiting on the child.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for [`CommandExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub timeouts: TimeoutConfig,
    /// Grace period in seconds between SIGTERM and SIGKILL.
    pub termination_grace_seconds: u64,
    /// Extra variables passed through on top of [`ENV_ALLOWLIST`].
    pub extra_env: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            termination_grace_seconds: 10,
            extra_env: Vec::new(),
        }
    }
}

/// Runs build programs as child processes.
pub struct CommandExecutor {
    config: ExecutorConfig,
    cancelled: Arc<AtomicBool>,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> ExecutorResult<Self> {
        config.timeouts.validate()?;
        Ok(Self {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Use an externally owned cancellation flag (e.g. the signal handler's).
    pub fn with_cancellation_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn build_environment(&self) -> Vec<(String, String)> {
        let allowed = |key: &str| {
            ENV_ALLOWLIST.contains(&key) || self.config.extra_env.iter().any(|k| k == key)
        };

        let mut env = Vec::new();
        let mut dropped = Vec::new();
        for (key, value) in std::env::vars() {
            if allowed(&key) {
                env.push((key, value));
            } else {
                dropped.push(key);
            }
        }

        if !dropped.is_empty() {
            tracing::trace!(dropped = %dropped.join(","), "dropped environment variables");
        }
        env
    }

    fn spawn_streamer<R: Read + Send + 'static>(
        reader: Option<R>,
        prefix: &'static str,
        sink: Arc<Mutex<Option<File>>>,
        activity: Arc<Mutex<Instant>>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let Some(reader) = reader else {
                return;
            };
            for line in BufReader::new(reader).lines().map_while(Result::ok) {
                if let Ok(mut last) = activity.lock() {
                    *last = Instant::now();
                }
                if let Ok(mut guard) = sink.lock() {
                    if let Some(file) = guard.as_mut() {
                        let _ = writeln!(file, "{}{}", prefix, line);
                    }
                }
            }
        })
    }

    /// Terminate a child gracefully, then forcefully.
    fn terminate_child(&self, child: &mut Child) -> ExecutorResult<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let grace = Duration::from_secs(self.config.termination_grace_seconds);
        let start = Instant::now();
        while start.elapsed() < grace {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        tracing::warn!(pid = child.id(), "build did not exit after SIGTERM, killing");
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }

    fn signal_name(status: &ExitStatus) -> Option<String> {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(|s| format!("SIG{}", s))
        }
        #[cfg(not(unix))]
        {
            let _ = status;
            None
        }
    }
}

impl Executor for CommandExecutor {
    fn run(&self, request: &BuildRequest) -> ExecutorResult<BuildOutcome> {
        if !request.program.is_file() {
            return Err(ExecutorError::ProgramNotFound(request.program.clone()));
        }

        let work_dir = request.effective_work_dir();
        fs::create_dir_all(work_dir)?;

        let log_file = match &request.log_path {
            Some(path) => Some(open_log(path)?),
            None => None,
        };
        let sink = Arc::new(Mutex::new(log_file));

        let argv = request.argv();
        tracing::info!(
            program = %request.program.display(),
            args = %argv.join(" "),
            "starting build"
        );

        let mut child = Command::new(&request.program)
            .args(&argv)
            .current_dir(work_dir)
            .env_clear()
            .envs(self.build_environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;

        let mut enforcer = TimeoutEnforcer::new(self.config.timeouts);
        let activity = Arc::new(Mutex::new(Instant::now()));
        let stdout = Self::spawn_streamer(
            child.stdout.take(),
            "",
            Arc::clone(&sink),
            Arc::clone(&activity),
        );
        let stderr = Self::spawn_streamer(
            child.stderr.take(),
            "[stderr] ",
            Arc::clone(&sink),
            Arc::clone(&activity),
        );

        let mut interrupted: Option<BuildStatus> = None;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if self.is_cancelled() {
                tracing::warn!("cancellation requested, terminating build");
                interrupted = Some(BuildStatus::Cancelled);
            } else {
                if let Ok(last) = activity.lock() {
                    enforcer.sync_activity(*last);
                }
                match enforcer.check() {
                    TimeoutStatus::Ok => {}
                    timeout => {
                        tracing::warn!(?timeout, elapsed = ?enforcer.elapsed(), "build timed out");
                        interrupted = Some(BuildStatus::TimedOut);
                    }
                }
            }

            if interrupted.is_some() {
                self.terminate_child(&mut child)?;
                break child.wait()?;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        // an interrupted build may leave grandchildren holding the pipes
        if interrupted.is_none() {
            let _ = stdout.join();
            let _ = stderr.join();
        }

        let duration_ms = enforcer.elapsed().as_millis() as u64;
        let outcome = BuildOutcome {
            status: match interrupted {
                Some(s) => s,
                None if status.success() => BuildStatus::Success,
                None => BuildStatus::Failed,
            },
            exit_code: status.code(),
            term_signal: Self::signal_name(&status),
            duration_ms,
        };

        tracing::info!(
            status = ?outcome.status,
            exit_code = ?outcome.exit_code,
            duration_ms,
            "build finished"
        );
        Ok(outcome)
    }
}

fn open_log(path: &Path) -> ExecutorResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
