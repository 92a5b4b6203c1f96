//! Catalog row types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use dbflow_inspector::FileDescription;
use dbflow_model::{
    CodeId, DateRange, FileId, InstrumentId, ProcessId, ProductId, Timebase, Version, VersionPart,
};

/// Mission directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionRecord {
    pub mission_name: String,
    pub rootdir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub instrument_id: InstrumentId,
    pub instrument_name: String,
    pub satellite_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: ProductId,
    pub product_name: String,
    pub instrument_id: InstrumentId,
    pub level: f64,
    /// Filename template
    pub format: String,
    /// Directory template under the mission root
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    pub process_name: String,
    pub output_product: ProductId,
    pub output_timebase: Timebase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<String>,
}

/// One declared input of a process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessInput {
    pub product_id: ProductId,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub code_id: CodeId,
    pub process_id: ProcessId,
    pub filename: String,
    pub relative_path: String,
    pub code_start_date: NaiveDate,
    pub code_stop_date: NaiveDate,
    pub code_version: Version,
    /// Version given to outputs with no earlier version
    pub output_version: Version,
    pub active: bool,
}

/// An inspector registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectorRecord {
    pub inspector_id: i64,
    /// Registry key of the implementation
    pub name: String,
    pub product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    pub active: bool,
}

/// A cataloged file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub filename: String,
    pub product_id: ProductId,
    pub utc_file_date: NaiveDate,
    pub utc_start_time: NaiveDateTime,
    pub utc_stop_time: NaiveDateTime,
    pub version: Version,
    pub newest_version: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_keyword: Option<String>,
    pub data_level: f64,
    pub shasum: String,
    pub file_create_date: NaiveDateTime,
    pub exists_on_disk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveats: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_provenance: Option<String>,
}

impl FileRecord {
    /// First and last calendar date the file covers.
    ///
    /// Never starts after `utc_file_date` nor ends before it.
    pub fn date_span(&self) -> (NaiveDate, NaiveDate) {
        let start = self.utc_start_time.date().min(self.utc_file_date);
        let stop = self.utc_stop_time.date().max(self.utc_file_date);
        (start, stop)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        let (start, stop) = self.date_span();
        dbflow_model::expand_dates(start, stop)
    }
}

/// A file about to be cataloged, with its provenance.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub description: FileDescription,
    /// Files it was built from
    pub parents: Vec<FileId>,
    /// Code that built it
    pub code: Option<CodeId>,
}

impl From<FileDescription> for NewFile {
    fn from(description: FileDescription) -> Self {
        Self {
            description,
            parents: Vec::new(),
            code: None,
        }
    }
}

/// Filter for bulk file selection.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub product: Option<ProductId>,
    /// Files linked to this producing code
    pub code: Option<CodeId>,
    pub instrument: Option<InstrumentId>,
    pub level: Option<f64>,
    /// Inclusive bounds on `utc_file_date`
    pub range: DateRange,
    pub newest_only: bool,
}

/// A process queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub file_id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_bump: Option<VersionPart>,
}

impl QueueEntry {
    pub fn new(file_id: FileId, version_bump: Option<VersionPart>) -> Self {
        Self {
            file_id,
            version_bump,
        }
    }
}

/// A persisted "currently running" lease on a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub scope: ProcessId,
    pub owner_id: String,
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
}

/// Names a file by catalog id or by filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileSelector {
    Id(FileId),
    Name(String),
}

impl From<FileId> for FileSelector {
    fn from(id: FileId) -> Self {
        FileSelector::Id(id)
    }
}

impl From<&str> for FileSelector {
    fn from(name: &str) -> Self {
        FileSelector::Name(name.to_string())
    }
}

impl From<String> for FileSelector {
    fn from(name: String) -> Self {
        FileSelector::Name(name)
    }
}

impl FromStr for FileSelector {
    type Err = std::convert::Infallible;

    /// All-digit input is an id, anything else a filename.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<FileId>() {
            Ok(id) if !s.starts_with('+') => FileSelector::Id(id),
            _ => FileSelector::Name(s.to_string()),
        })
    }
}

impl fmt::Display for FileSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSelector::Id(id) => write!(f, "{}", id),
            FileSelector::Name(name) => f.write_str(name),
        }
    }
}

/// Names a catalog object by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRef {
    Id(i64),
    Name(String),
}

impl FromStr for CatalogRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<i64>() {
            Ok(id) => CatalogRef::Id(id),
            Err(_) => CatalogRef::Name(s.to_string()),
        })
    }
}

impl fmt::Display for CatalogRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogRef::Id(id) => write!(f, "{}", id),
            CatalogRef::Name(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parse() {
        assert_eq!("17".parse::<FileSelector>().unwrap(), FileSelector::Id(17));
        assert_eq!(
            "hope_20130904_v1.0.0.cdf".parse::<FileSelector>().unwrap(),
            FileSelector::Name("hope_20130904_v1.0.0.cdf".into())
        );
        assert_eq!("+5".parse::<FileSelector>().unwrap(), FileSelector::Name("+5".into()));
    }

    #[test]
    fn test_catalog_ref_parse() {
        assert_eq!("3".parse::<CatalogRef>().unwrap(), CatalogRef::Id(3));
        assert_eq!("l1_code".parse::<CatalogRef>().unwrap(), CatalogRef::Name("l1_code".into()));
    }
}
