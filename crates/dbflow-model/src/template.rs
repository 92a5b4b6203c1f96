//! Filename and directory templates.
//!
//! Product filenames and relative paths are stored as templates such as
//! `{MISSION}/{INSTRUMENT}/L1/{Y}` or `{SATELLITE}_L1_{Y}{m}{d}_v{VERSION}.cdf`.
//! Rendering substitutes date fields, the file version and catalog names.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::{FormatError, Version};

/// A token that may appear inside `{...}` in a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Four digit year
    Year,
    /// Two digit month
    Month,
    /// Two digit day of month
    Day,
    /// Three letter month abbreviation
    MonthAbbrev,
    /// Two digit year
    ShortYear,
    /// Three digit day of year
    DayOfYear,
    Hour,
    Minute,
    Second,
    /// `YYYYMMDD`
    Date,
    Version,
    Instrument,
    Satellite,
    Spacecraft,
    Mission,
    Product,
    /// Process keyword of the file
    Keyword,
}

impl Token {
    pub fn from_name(name: &str) -> Option<Self> {
        let token = match name {
            "Y" => Token::Year,
            "m" => Token::Month,
            "d" => Token::Day,
            "b" => Token::MonthAbbrev,
            "y" => Token::ShortYear,
            "j" => Token::DayOfYear,
            "H" => Token::Hour,
            "M" => Token::Minute,
            "S" => Token::Second,
            "DATE" => Token::Date,
            "VERSION" => Token::Version,
            "INSTRUMENT" => Token::Instrument,
            "SATELLITE" => Token::Satellite,
            "SPACECRAFT" => Token::Spacecraft,
            "MISSION" => Token::Mission,
            "PRODUCT" => Token::Product,
            "KEYWORD" => Token::Keyword,
            _ => return None,
        };
        Some(token)
    }
}

/// Piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Token(Token),
}

/// Split a template into literal text and tokens.
pub fn parse(template: &str) -> Result<Vec<Segment>, FormatError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        literal.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| FormatError::UnterminatedToken(template.to_string()))?;
        let name = &after[..close];
        let token =
            Token::from_name(name).ok_or_else(|| FormatError::TemplateToken(name.to_string()))?;
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Token(token));
        rest = &after[close + 1..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

/// Values available while rendering a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// File date, used by the date tokens
    pub date: Option<NaiveDate>,
    /// Start time, used by `{H}`, `{M}` and `{S}`; midnight of `date` when unset
    pub start_time: Option<NaiveDateTime>,
    pub version: Option<Version>,
    pub instrument: Option<String>,
    pub satellite: Option<String>,
    pub spacecraft: Option<String>,
    pub mission: Option<String>,
    pub product: Option<String>,
    pub keyword: Option<String>,
}

impl TemplateContext {
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_start_time(mut self, start_time: NaiveDateTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Render a template, failing on unknown tokens or missing values.
    pub fn render(&self, template: &str) -> Result<String, FormatError> {
        let mut out = String::with_capacity(template.len());
        for segment in parse(template)? {
            match segment {
                Segment::Literal(text) => out.push_str(&text),
                Segment::Token(token) => out.push_str(&self.value(token)?),
            }
        }
        Ok(out)
    }

    fn value(&self, token: Token) -> Result<String, FormatError> {
        let missing = |name: &str| FormatError::MissingValue(name.to_string());
        let dt = || self.date.ok_or_else(|| missing("date"));
        let time = || {
            self.start_time
                .or_else(|| self.date.and_then(|d| d.and_hms_opt(0, 0, 0)))
                .ok_or_else(|| missing("time"))
        };

        let value = match token {
            Token::Year => format!("{:04}", dt()?.year()),
            Token::Month => format!("{:02}", dt()?.month()),
            Token::Day => format!("{:02}", dt()?.day()),
            Token::MonthAbbrev => dt()?.format("%b").to_string(),
            Token::ShortYear => dt()?.format("%y").to_string(),
            Token::DayOfYear => format!("{:03}", dt()?.ordinal()),
            Token::Hour => format!("{:02}", time()?.hour()),
            Token::Minute => format!("{:02}", time()?.minute()),
            Token::Second => format!("{:02}", time()?.second()),
            Token::Date => dt()?.format("%Y%m%d").to_string(),
            Token::Version => self.version.ok_or_else(|| missing("VERSION"))?.to_string(),
            Token::Instrument => self.instrument.clone().ok_or_else(|| missing("INSTRUMENT"))?,
            // spacecraft is an alias of satellite unless set explicitly
            Token::Satellite => self.satellite.clone().ok_or_else(|| missing("SATELLITE"))?,
            Token::Spacecraft => self
                .spacecraft
                .clone()
                .or_else(|| self.satellite.clone())
                .ok_or_else(|| missing("SPACECRAFT"))?,
            Token::Mission => self.mission.clone().ok_or_else(|| missing("MISSION"))?,
            Token::Product => self.product.clone().ok_or_else(|| missing("PRODUCT"))?,
            Token::Keyword => self.keyword.clone().ok_or_else(|| missing("KEYWORD"))?,
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            instrument: Some("hope".into()),
            satellite: Some("rbspa".into()),
            mission: Some("rbsp".into()),
            product: Some("hope_l1".into()),
            ..Default::default()
        }
        .with_date(NaiveDate::from_ymd_opt(2013, 9, 4).unwrap())
        .with_version(Version::new(1, 2, 3))
    }

    #[test]
    fn test_render_filename() {
        let name = ctx()
            .render("{SATELLITE}_{INSTRUMENT}_L1_{Y}{m}{d}_v{VERSION}.cdf")
            .unwrap();
        assert_eq!(name, "rbspa_hope_L1_20130904_v1.2.3.cdf");
    }

    #[test]
    fn test_render_date_forms() {
        let out = ctx().render("{y}/{j}/{b}/{DATE}/{H}{M}{S}").unwrap();
        assert_eq!(out, "13/247/Sep/20130904/000000");
    }

    #[test]
    fn test_time_tokens_use_start_time() {
        let start = NaiveDate::from_ymd_opt(2013, 9, 4)
            .unwrap()
            .and_hms_opt(13, 5, 9)
            .unwrap();
        let out = ctx().with_start_time(start).render("{Y}{m}{d}T{H}{M}{S}").unwrap();
        assert_eq!(out, "20130904T130509");
    }

    #[test]
    fn test_spacecraft_falls_back_to_satellite() {
        assert_eq!(ctx().render("{SPACECRAFT}").unwrap(), "rbspa");
    }

    #[test]
    fn test_unknown_and_unterminated_tokens() {
        assert_eq!(
            ctx().render("{NOPE}").unwrap_err(),
            FormatError::TemplateToken("NOPE".into())
        );
        assert!(matches!(
            ctx().render("abc_{Y"),
            Err(FormatError::UnterminatedToken(_))
        ));
    }

    #[test]
    fn test_missing_value() {
        let empty = TemplateContext::default();
        assert_eq!(
            empty.render("{VERSION}").unwrap_err(),
            FormatError::MissingValue("VERSION".into())
        );
        assert_eq!(empty.render("plain.txt").unwrap(), "plain.txt");
    }

    #[test]
    fn test_parse_segments() {
        let segments = parse("a_{Y}_b").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("a_".into()),
                Segment::Token(Token::Year),
                Segment::Literal("_b".into()),
            ]
        );
    }
}
