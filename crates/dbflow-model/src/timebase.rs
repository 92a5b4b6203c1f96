use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::FormatError;

/// Scheduling policy of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Timebase {
    /// One output per input file: exact date and process keyword match.
    File,
    /// One output per day, aggregating every input that covers the day.
    Daily,
    /// Evaluated once per scheduling cycle.
    Run,
}

impl Timebase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timebase::File => "FILE",
            Timebase::Daily => "DAILY",
            Timebase::Run => "RUN",
        }
    }
}

impl fmt::Display for Timebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timebase {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FILE" => Ok(Timebase::File),
            "DAILY" => Ok(Timebase::Daily),
            "RUN" => Ok(Timebase::Run),
            _ => Err(FormatError::Timebase(s.to_string())),
        }
    }
}
