//! Format errors for model values.

/// A value could not be parsed or rendered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("invalid version string {0:?}: expected three dot-separated integers")]
    Version(String),

    #[error("version {version} has no room left in its {part} component")]
    VersionOverflow {
        version: crate::Version,
        part: crate::VersionPart,
    },

    #[error("invalid version part {0}: expected 0 (interface), 1 (quality) or 2 (revision)")]
    VersionPart(i64),

    #[error("invalid timebase {0:?}: expected FILE, DAILY or RUN")]
    Timebase(String),

    #[error("invalid date {0:?}: expected YYYY-MM-DD")]
    Date(String),

    #[error("invalid date range: {start} is after {end}")]
    DateRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("unknown template token {{{0}}}")]
    TemplateToken(String),

    #[error("unterminated template token in {0:?}")]
    UnterminatedToken(String),

    #[error("no value available for template token {0}")]
    MissingValue(String),
}
