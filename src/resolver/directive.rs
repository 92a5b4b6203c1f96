use std::collections::VecDeque;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use dbflow_model::{FileId, ProcessId, VersionPart};

/// One resolved build: run `process_id` for `date` over `inputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDirective {
    pub process_id: ProcessId,
    pub date: NaiveDate,
    /// Input file ids in process-input order
    pub inputs: Vec<FileId>,
    /// Keyword of the triggering file, carried into the output name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_keyword: Option<String>,
    /// Component to bump on the output, from the triggering queue entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_bump: Option<VersionPart>,
}

impl BuildDirective {
    /// Same process, date and inputs; the version bump is not compared.
    pub fn same_build(&self, other: &BuildDirective) -> bool {
        self.process_id == other.process_id
            && self.date == other.date
            && self.inputs == other.inputs
    }
}

impl fmt::Display for BuildDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process {} on {} from {:?}", self.process_id, self.date, self.inputs)?;
        if let Some(part) = self.version_bump {
            write!(f, " (bump {})", part)?;
        }
        Ok(())
    }
}

/// Directives resolved but not yet dispatched this cycle, in order.
#[derive(Debug, Default, Clone)]
pub struct PendingDirectives {
    items: VecDeque<BuildDirective>,
}

impl PendingDirectives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, directive: &BuildDirective) -> bool {
        self.items.iter().any(|d| d.same_build(directive))
    }

    /// A directive for `process` on `date` is already pending.
    pub fn has_process_date(&self, process: ProcessId, date: NaiveDate) -> bool {
        self.items
            .iter()
            .any(|d| d.process_id == process && d.date == date)
    }

    /// Add unless an equivalent directive is pending. Returns whether added.
    pub fn insert(&mut self, directive: BuildDirective) -> bool {
        if self.contains(&directive) {
            return false;
        }
        self.items.push_back(directive);
        true
    }

    pub fn pop_front(&mut self) -> Option<BuildDirective> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuildDirective> {
        self.items.iter()
    }
}
