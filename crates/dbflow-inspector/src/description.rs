use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use dbflow_model::{ProductId, TemplateContext, Version};

/// What an inspector knows about the product it is asked to recognise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductContext {
    pub product_id: ProductId,
    pub product_name: String,
    pub level: f64,
    /// Filename template of the product
    pub format: String,
    pub instrument: String,
    pub satellite: String,
    pub mission: String,
}

impl ProductContext {
    /// Template context carrying this product's catalog names.
    pub fn template_context(&self) -> TemplateContext {
        TemplateContext {
            instrument: Some(self.instrument.clone()),
            satellite: Some(self.satellite.clone()),
            mission: Some(self.mission.clone()),
            product: Some(self.product_name.clone()),
            ..Default::default()
        }
    }
}

/// The fields an inspector extracts from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    pub utc_file_date: NaiveDate,
    pub utc_start_time: NaiveDateTime,
    pub utc_stop_time: NaiveDateTime,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveats: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_provenance: Option<String>,
}

impl Inspection {
    /// An inspection for a file covering exactly one calendar day.
    pub fn for_day(date: NaiveDate, version: Version) -> Self {
        let start = date.and_time(chrono::NaiveTime::MIN);
        let stop = date
            .and_hms_milli_opt(23, 59, 59, 999)
            .unwrap_or(start);
        Self {
            utc_file_date: date,
            utc_start_time: start,
            utc_stop_time: stop,
            version,
            process_keyword: None,
            quality_comment: None,
            caveats: None,
            release_number: None,
            verbose_provenance: None,
        }
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.process_keyword = Some(keyword.into());
        self
    }
}

/// A fully populated description of a recognised file, ready to catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescription {
    /// Base filename
    pub filename: String,
    pub product_id: ProductId,
    pub data_level: f64,
    pub mission: String,
    pub utc_file_date: NaiveDate,
    pub utc_start_time: NaiveDateTime,
    pub utc_stop_time: NaiveDateTime,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_keyword: Option<String>,
    /// SHA-256 hex digest of the contents
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
    /// Name of the inspector that claimed the file
    pub inspector: String,
}

impl FileDescription {
    /// Combine an inspection with the fields the registry fills in.
    pub(crate) fn populate(
        filename: String,
        product: &ProductContext,
        inspection: Inspection,
        shasum: String,
        file_create_date: NaiveDateTime,
        inspector: &str,
    ) -> Self {
        Self {
            filename,
            product_id: product.product_id,
            // level always comes from the product definition
            data_level: product.level,
            mission: product.mission.clone(),
            utc_file_date: inspection.utc_file_date,
            utc_start_time: inspection.utc_start_time,
            utc_stop_time: inspection.utc_stop_time,
            version: inspection.version,
            process_keyword: inspection.process_keyword,
            shasum,
            file_create_date,
            exists_on_disk: true,
            quality_comment: inspection.quality_comment,
            caveats: inspection.caveats,
            release_number: inspection.release_number,
            verbose_provenance: inspection.verbose_provenance,
            inspector: inspector.to_string(),
        }
    }

    /// Check the description is internally consistent.
    ///
    /// Returns the name of the first offending field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.filename.is_empty() {
            return Err("filename");
        }
        if self.mission.is_empty() {
            return Err("mission");
        }
        if self.utc_start_time > self.utc_stop_time {
            return Err("utc_stop_time");
        }
        if self.utc_file_date < self.utc_start_time.date()
            || self.utc_file_date > self.utc_stop_time.date()
        {
            return Err("utc_file_date");
        }
        if self.shasum.len() != 64 || !self.shasum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err("shasum");
        }
        if matches!(&self.process_keyword, Some(k) if k.is_empty()) {
            return Err("process_keyword");
        }
        Ok(())
    }

    /// Calendar dates this file covers, first to last.
    pub fn dates(&self) -> Vec<NaiveDate> {
        dbflow_model::expand_dates(self.utc_start_time.date(), self.utc_stop_time.date())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> ProductContext {
        ProductContext {
            product_id: 3,
            product_name: "hope_l1".into(),
            level: 1.0,
            format: "hope_{Y}{m}{d}_v{VERSION}.cdf".into(),
            instrument: "hope".into(),
            satellite: "rbspa".into(),
            mission: "rbsp".into(),
        }
    }

    fn describe(inspection: Inspection) -> FileDescription {
        let created = inspection.utc_start_time;
        FileDescription::populate(
            "hope_20130904_v1.0.0.cdf".into(),
            &product(),
            inspection,
            "a".repeat(64),
            created,
            "template",
        )
    }

    #[test]
    fn test_for_day_spans_single_date() {
        let date = NaiveDate::from_ymd_opt(2013, 9, 4).unwrap();
        let desc = describe(Inspection::for_day(date, Version::default()));
        assert_eq!(desc.dates(), vec![date]);
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_populate_takes_level_from_product() {
        let date = NaiveDate::from_ymd_opt(2013, 9, 4).unwrap();
        let desc = describe(Inspection::for_day(date, Version::default()));
        assert_eq!(desc.product_id, 3);
        assert_eq!(desc.data_level, 1.0);
        assert_eq!(desc.mission, "rbsp");
        assert!(desc.exists_on_disk);
    }

    #[test]
    fn test_validate_rejects_date_outside_span() {
        let date = NaiveDate::from_ymd_opt(2013, 9, 4).unwrap();
        let mut inspection = Inspection::for_day(date, Version::default());
        inspection.utc_file_date = NaiveDate::from_ymd_opt(2013, 9, 5).unwrap();
        assert_eq!(describe(inspection).validate(), Err("utc_file_date"));
    }

    #[test]
    fn test_validate_rejects_bad_digest() {
        let date = NaiveDate::from_ymd_opt(2013, 9, 4).unwrap();
        let mut desc = describe(Inspection::for_day(date, Version::default()));
        desc.shasum = "xyz".into();
        assert_eq!(desc.validate(), Err("shasum"));
    }
}
