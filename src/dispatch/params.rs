//! Extra-argument expansion for build commands.
//!
//! A process may carry an argument template such as
//! `--date=%DATE -o %OUTFILE --cal %BASEDIR/cal`. Words are split on
//! whitespace, then on `=`, and each piece has its placeholders replaced.

use std::path::Path;

use chrono::NaiveDate;

use dbflow_model::FormatError;

/// Values available to `%NAME` placeholders.
#[derive(Debug, Clone)]
pub struct ParamValues<'a> {
    pub date: NaiveDate,
    pub outfile: &'a Path,
    pub basedir: &'a Path,
    pub codedir: &'a Path,
}

impl ParamValues<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "DATE" => Some(self.date.format("%Y%m%d").to_string()),
            "OUTFILE" => Some(self.outfile.display().to_string()),
            "BASEDIR" => Some(self.basedir.display().to_string()),
            "CODEDIR" => Some(self.codedir.display().to_string()),
            _ => None,
        }
    }
}

/// Expand `template` into an argument list.
///
/// `None` or an all-blank template yields no arguments. A `%` followed by
/// an unknown upper-case name is an error; any other `%` is kept.
pub fn expand_params(
    template: Option<&str>,
    values: &ParamValues<'_>,
) -> Result<Vec<String>, FormatError> {
    let Some(template) = template else {
        return Ok(Vec::new());
    };
    template
        .split_whitespace()
        .flat_map(|word| word.split('='))
        .filter(|piece| !piece.is_empty())
        .map(|piece| substitute(piece, values))
        .collect()
}

fn substitute(piece: &str, values: &ParamValues<'_>) -> Result<String, FormatError> {
    let mut out = String::with_capacity(piece.len());
    let mut rest = piece;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let name_len = after
            .bytes()
            .take_while(|b| b.is_ascii_uppercase())
            .count();
        if name_len == 0 {
            out.push('%');
            rest = after;
            continue;
        }
        let name = &after[..name_len];
        let value = values
            .lookup(name)
            .ok_or_else(|| FormatError::TemplateToken(format!("%{}", name)))?;
        out.push_str(&value);
        rest = &after[name_len..];
    }
    out.push_str(rest);
    Ok(out)
}
