//! Built-in inspector driven by the product's filename template.
//!
//! The product format, e.g. `{SATELLITE}_hope_L1_{Y}{m}{d}_v{VERSION}.cdf`,
//! is compiled into an anchored regular expression. Catalog names are
//! matched literally; date, version and keyword tokens become capture
//! groups.
//!
//! Recognised arguments: `version=a.b.c` (used when the template has no
//! `{VERSION}`), `keyword=...` (process keyword when the template has no
//! `{KEYWORD}`), `release=N`.

use std::collections::HashSet;
use std::path::Path;

use chrono::{NaiveDate, NaiveTime};
use regex_lite::{Captures, Regex};

use dbflow_model::template::{self, Segment, Token};
use dbflow_model::Version;

use crate::{InspectError, Inspection, Inspector, Kwargs, ProductContext};

/// Matches filenames against the product's `format` template.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateInspector;

impl TemplateInspector {
    /// Compile a product format into an anchored regex.
    pub fn compile(product: &ProductContext) -> Result<Regex, InspectError> {
        let names = product.template_context();
        let mut pattern = String::from("^");
        let mut seen: HashSet<&'static str> = HashSet::new();

        for segment in template::parse(&product.format)? {
            let token = match segment {
                Segment::Literal(text) => {
                    pattern.push_str(&regex_lite::escape(&text));
                    continue;
                }
                Segment::Token(token) => token,
            };

            let (group, body) = match token {
                Token::Year => ("Y", r"\d{4}"),
                Token::Month => ("m", r"\d{2}"),
                Token::Day => ("d", r"\d{2}"),
                Token::MonthAbbrev => ("b", r"[A-Za-z]{3}"),
                Token::ShortYear => ("y", r"\d{2}"),
                Token::DayOfYear => ("j", r"\d{3}"),
                Token::Hour => ("H", r"\d{2}"),
                Token::Minute => ("M", r"\d{2}"),
                Token::Second => ("S", r"\d{2}"),
                Token::Date => ("DATE", r"\d{8}"),
                Token::Version => ("VERSION", r"\d+\.\d+\.\d+"),
                Token::Keyword => ("KEYWORD", r"[A-Za-z0-9-]+"),
                Token::Instrument
                | Token::Satellite
                | Token::Spacecraft
                | Token::Mission
                | Token::Product => {
                    let literal = names.render(&format!("{{{}}}", token_name(token)))?;
                    pattern.push_str(&regex_lite::escape(&literal));
                    continue;
                }
            };

            // capture the first occurrence only; group names must be unique
            if seen.insert(group) {
                pattern.push_str(&format!("(?P<{}>{})", group, body));
            } else {
                pattern.push_str(&format!("(?:{})", body));
            }
        }
        pattern.push('$');

        Regex::new(&pattern).map_err(|e| InspectError::BadArgument(e.to_string()))
    }

    fn date_from(caps: &Captures<'_>) -> Option<NaiveDate> {
        if let Some(date) = caps.name("DATE") {
            return NaiveDate::parse_from_str(date.as_str(), "%Y%m%d").ok();
        }

        let year: i32 = match (caps.name("Y"), caps.name("y")) {
            (Some(y), _) => y.as_str().parse().ok()?,
            // two digit years pivot at 1970, same as strptime
            (None, Some(y)) => {
                let short: i32 = y.as_str().parse().ok()?;
                if short < 69 {
                    2000 + short
                } else {
                    1900 + short
                }
            }
            (None, None) => return None,
        };

        if let Some(doy) = caps.name("j") {
            return NaiveDate::from_yo_opt(year, doy.as_str().parse().ok()?);
        }

        let month: u32 = match (caps.name("m"), caps.name("b")) {
            (Some(m), _) => m.as_str().parse().ok()?,
            (None, Some(b)) => month_from_abbrev(b.as_str())?,
            (None, None) => return None,
        };
        let day: u32 = caps.name("d")?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    }

    fn time_from(caps: &Captures<'_>) -> Option<NaiveTime> {
        let field = |name: &str| -> Option<u32> {
            match caps.name(name) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(0),
            }
        };
        caps.name("H")?;
        NaiveTime::from_hms_opt(field("H")?, field("M")?, field("S")?)
    }
}

impl Inspector for TemplateInspector {
    fn inspect(
        &self,
        path: &Path,
        product: &ProductContext,
        args: &Kwargs,
    ) -> Result<Option<Inspection>, InspectError> {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };

        let regex = Self::compile(product)?;
        let Some(caps) = regex.captures(filename) else {
            return Ok(None);
        };

        let date = match Self::date_from(&caps).or_else(|| extract_yyyymmdd(filename)) {
            Some(date) => date,
            None => return Ok(None),
        };

        let version = match caps.name("VERSION") {
            Some(v) => v.as_str().parse()?,
            None => match args.get("version") {
                Some(v) => v.parse()?,
                None => Version::default(),
            },
        };

        let mut inspection = Inspection::for_day(date, version);
        if let Some(time) = Self::time_from(&caps) {
            inspection.utc_start_time = date.and_time(time);
        }
        inspection.process_keyword = caps
            .name("KEYWORD")
            .map(|k| k.as_str().to_string())
            .or_else(|| args.get("keyword").cloned());
        if let Some(release) = args.get("release") {
            let number = release
                .parse()
                .map_err(|_| InspectError::BadArgument(format!("release={}", release)))?;
            inspection.release_number = Some(number);
        }

        Ok(Some(inspection))
    }
}

fn token_name(token: Token) -> &'static str {
    match token {
        Token::Instrument => "INSTRUMENT",
        Token::Satellite => "SATELLITE",
        Token::Spacecraft => "SPACECRAFT",
        Token::Mission => "MISSION",
        _ => "PRODUCT",
    }
}

fn month_from_abbrev(abbrev: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = abbrev.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|i| i as u32 + 1)
}

/// First run of eight digits in `name` that forms a valid `YYYYMMDD` date.
pub fn extract_yyyymmdd(name: &str) -> Option<NaiveDate> {
    let bytes = name.as_bytes();
    if bytes.len() < 8 {
        return None;
    }
    (0..=bytes.len() - 8)
        .filter(|&i| bytes[i..i + 8].iter().all(u8::is_ascii_digit))
        .find_map(|i| NaiveDate::parse_from_str(&name[i..i + 8], "%Y%m%d").ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(format: &str) -> ProductContext {
        ProductContext {
            product_id: 1,
            product_name: "hope_l1".into(),
            level: 1.0,
            format: format.into(),
            instrument: "hope".into(),
            satellite: "rbspa".into(),
            mission: "rbsp".into(),
        }
    }

    fn inspect(format: &str, filename: &str, args: &str) -> Option<Inspection> {
        let kwargs = crate::parse_kwargs(Some(args)).unwrap();
        TemplateInspector
            .inspect(Path::new(filename), &product(format), &kwargs)
            .unwrap()
    }

    #[test]
    fn test_matches_filename_with_version() {
        let found = inspect(
            "{SATELLITE}_{INSTRUMENT}_L1_{Y}{m}{d}_v{VERSION}.cdf",
            "/data/incoming/rbspa_hope_L1_20130904_v1.2.3.cdf",
            "",
        )
        .unwrap();
        assert_eq!(found.utc_file_date, NaiveDate::from_ymd_opt(2013, 9, 4).unwrap());
        assert_eq!(found.version, Version::new(1, 2, 3));
        assert!(found.process_keyword.is_none());
    }

    #[test]
    fn test_rejects_other_products() {
        assert!(inspect(
            "{SATELLITE}_{INSTRUMENT}_L1_{Y}{m}{d}_v{VERSION}.cdf",
            "rbspb_hope_L1_20130904_v1.2.3.cdf",
            "",
        )
        .is_none());
        assert!(inspect("{SATELLITE}_{Y}{m}{d}.cdf", "rbspa_20130904.cdf.bak", "").is_none());
    }

    #[test]
    fn test_version_and_keyword_from_args() {
        let found = inspect("raw_{DATE}.bin", "raw_20200229.bin", "version=2.0.1 keyword=burst release=3")
            .unwrap();
        assert_eq!(found.version, Version::new(2, 0, 1));
        assert_eq!(found.process_keyword.as_deref(), Some("burst"));
        assert_eq!(found.release_number, Some(3));
    }

    #[test]
    fn test_keyword_token_and_day_of_year() {
        let found = inspect("{PRODUCT}_{KEYWORD}_{Y}{j}.dat", "hope_l1_seg-04_2013247.dat", "").unwrap();
        assert_eq!(found.process_keyword.as_deref(), Some("seg-04"));
        assert_eq!(found.utc_file_date, NaiveDate::from_ymd_opt(2013, 9, 4).unwrap());
    }

    #[test]
    fn test_time_tokens_set_start() {
        let found = inspect("obs_{Y}{m}{d}T{H}{M}.dat", "obs_20130904T1230.dat", "").unwrap();
        assert_eq!(found.utc_start_time.time(), NaiveTime::from_hms_opt(12, 30, 0).unwrap());
        assert_eq!(found.utc_stop_time.date(), found.utc_file_date);
    }

    #[test]
    fn test_invalid_date_is_no_match() {
        assert!(inspect("raw_{Y}{m}{d}.bin", "raw_20131340.bin", "").is_none());
    }

    #[test]
    fn test_bad_version_arg_is_error() {
        let kwargs = crate::parse_kwargs(Some("version=1.2")).unwrap();
        let result = TemplateInspector.inspect(
            Path::new("raw_20200101.bin"),
            &product("raw_{DATE}.bin"),
            &kwargs,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_extract_yyyymmdd() {
        assert_eq!(
            extract_yyyymmdd("x_99999999_20121231_v1.cdf"),
            NaiveDate::from_ymd_opt(2012, 12, 31)
        );
        assert_eq!(extract_yyyymmdd("nodate.cdf"), None);
        assert_eq!(extract_yyyymmdd("short"), None);
    }
}
