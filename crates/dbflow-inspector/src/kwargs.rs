use std::collections::BTreeMap;

use crate::InspectError;

/// Inspector keyword arguments.
pub type Kwargs = BTreeMap<String, String>;

/// Parse a catalog argument string such as `"foo=bar baz=qux"`.
///
/// Words are whitespace separated; each must be `key=value`. A later key
/// overrides an earlier one. `None` and empty input give an empty map.
pub fn parse_kwargs(args: Option<&str>) -> Result<Kwargs, InspectError> {
    let mut kwargs = Kwargs::new();
    let Some(args) = args else {
        return Ok(kwargs);
    };

    for word in args.split_whitespace() {
        match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                kwargs.insert(key.to_string(), value.to_string());
            }
            _ => return Err(InspectError::BadArgument(word.to_string())),
        }
    }

    Ok(kwargs)
}
