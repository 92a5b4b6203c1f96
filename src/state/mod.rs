//! File lifecycle state machine
//!
//! INCOMING → CLASSIFIED → CATALOGED → STAGED → QUEUED → RESOLVED →
//! BUILDING → BUILT, with ERRORED reachable from INCOMING, CLASSIFIED and
//! CATALOGED. A BUILT output re-enters at INCOMING.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    /// Present in the incoming area (or freshly built), not yet recognised
    Incoming,
    /// Claimed by exactly one inspector
    Classified,
    /// Row inserted, transaction still open
    Cataloged,
    /// Moved to its canonical location, transaction committed
    Staged,
    Queued,
    /// Dependency resolution ran against it
    Resolved,
    Building,
    Built,
    Errored,
}

impl FileState {
    pub fn can_transition_to(&self, target: FileState) -> bool {
        use FileState::*;
        match (self, target) {
            (Incoming, Classified) => true,
            (Incoming, Errored) => true,

            (Classified, Cataloged) => true,
            (Classified, Errored) => true,

            (Cataloged, Staged) => true,
            (Cataloged, Errored) => true, // rollback

            (Staged, Queued) => true,
            (Queued, Resolved) => true,
            (Resolved, Building) => true,
            (Building, Built) => true,

            // outputs are ingested like any other arrival
            (Built, Incoming) => true,

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Incoming => "INCOMING",
            FileState::Classified => "CLASSIFIED",
            FileState::Cataloged => "CATALOGED",
            FileState::Staged => "STAGED",
            FileState::Queued => "QUEUED",
            FileState::Resolved => "RESOLVED",
            FileState::Building => "BUILDING",
            FileState::Built => "BUILT",
            FileState::Errored => "ERRORED",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid lifecycle transition for {subject}: {from} -> {to}")]
pub struct TransitionError {
    pub subject: String,
    pub from: FileState,
    pub to: FileState,
}

/// Tracks one file through the lifecycle, logging each step.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    subject: String,
    state: FileState,
    history: Vec<FileState>,
}

impl Lifecycle {
    /// Start tracking `subject` (usually a filename) in INCOMING.
    pub fn incoming(subject: impl Into<String>) -> Self {
        Self::starting_at(subject, FileState::Incoming)
    }

    /// Start tracking a file that is already past ingestion, e.g. a
    /// cataloged file popped from the queue.
    pub fn starting_at(subject: impl Into<String>, state: FileState) -> Self {
        Self {
            subject: subject.into(),
            state,
            history: vec![state],
        }
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn history(&self) -> &[FileState] {
        &self.history
    }

    pub fn advance(&mut self, to: FileState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                subject: self.subject.clone(),
                from: self.state,
                to,
            });
        }
        if to == FileState::Errored {
            tracing::warn!(file = %self.subject, from = %self.state, "file errored");
        } else {
            tracing::debug!(file = %self.subject, from = %self.state, to = %to, "lifecycle");
        }
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut file = Lifecycle::incoming("hope_20130904_v1.0.0.cdf");
        for next in [
            FileState::Classified,
            FileState::Cataloged,
            FileState::Staged,
            FileState::Queued,
            FileState::Resolved,
            FileState::Building,
            FileState::Built,
            FileState::Incoming,
        ] {
            file.advance(next).unwrap();
        }
        assert_eq!(file.history().len(), 9);
        assert_eq!(file.state(), FileState::Incoming);
    }

    #[test]
    fn test_errored_reachable_only_early() {
        assert!(FileState::Incoming.can_transition_to(FileState::Errored));
        assert!(FileState::Classified.can_transition_to(FileState::Errored));
        assert!(FileState::Cataloged.can_transition_to(FileState::Errored));
        assert!(!FileState::Staged.can_transition_to(FileState::Errored));
        assert!(!FileState::Building.can_transition_to(FileState::Errored));
    }

    #[test]
    fn test_errored_is_terminal() {
        assert!(FileState::Errored.is_terminal());
        let mut file = Lifecycle::incoming("bad.dat");
        file.advance(FileState::Errored).unwrap();
        let err = file.advance(FileState::Classified).unwrap_err();
        assert_eq!(err.from, FileState::Errored);
    }

    #[test]
    fn test_no_skipping() {
        assert!(!FileState::Incoming.can_transition_to(FileState::Staged));
        assert!(!FileState::Queued.can_transition_to(FileState::Building));
        assert!(!FileState::Built.can_transition_to(FileState::Queued));
    }
}
