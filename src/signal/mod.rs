//! SIGINT/SIGTERM handling
//!
//! First signal: request a stop. The scheduler finishes (or, through the
//! shared flag, cancels) the running build and ends the cycle.
//! Second signal: exit immediately with [`EXIT_CODE_CANCELLED`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Exit code for cancelled runs
pub const EXIT_CODE_CANCELLED: i32 = 80;

/// Signal handler state
#[derive(Debug)]
pub struct SignalState {
    /// Shared with the executor so a stop also terminates the running child
    stop_requested: Arc<AtomicBool>,
    immediate_exit: AtomicBool,
    signal_count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Use an existing stop flag.
    pub fn with_flag(stop_requested: Arc<AtomicBool>) -> Self {
        Self {
            stop_requested,
            immediate_exit: AtomicBool::new(false),
            signal_count: AtomicU8::new(0),
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// The flag set on the first signal.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    /// Record a signal and decide what to do about it.
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            self.stop_requested.store(true, Ordering::SeqCst);
            SignalAction::RequestStop
        } else if count == 1 {
            self.immediate_exit.store(true, Ordering::SeqCst);
            SignalAction::ImmediateExit
        } else {
            SignalAction::Ignore
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    RequestStop,
    ImmediateExit,
    Ignore,
}

pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install the process-wide handler. Call once at startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::RequestStop => {
                tracing::warn!("interrupt received, stopping after the current build");
            }
            SignalAction::ImmediateExit => {
                tracing::error!("second interrupt received, exiting immediately");
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            SignalAction::Ignore => {}
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
