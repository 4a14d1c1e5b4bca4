//! Environment variable readers shared by the service configurations.
//!
//! Each reader returns `Ok(None)` when the variable is unset or blank and
//! [`Error::InvalidInput`] when it is set to something unparsable, so a
//! `from_env` constructor can start from defaults and override field by
//! field.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Reads a trimmed, non-empty string.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_parse<T>(name: &str, expected: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<T>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a {expected}: {e}")))
}

/// Reads a `u32`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the value is not a `u32`.
pub fn env_u32(name: &str) -> Result<Option<u32>> {
    env_parse(name, "u32")
}

/// Reads a `u64`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the value is not a `u64`.
pub fn env_u64(name: &str) -> Result<Option<u64>> {
    env_parse(name, "u64")
}

/// Reads a `usize`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the value is not a `usize`.
pub fn env_usize(name: &str) -> Result<Option<usize>> {
    env_parse(name, "usize")
}

/// Parses a boolean flag value.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for anything but true/false/1/0/yes/no.
pub fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

/// Reads a boolean flag.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the value is not a boolean.
pub fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

/// Reads a comma-separated list, dropping blank entries.
#[must_use]
pub fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|v| parse_list(&v))
}

/// Splits a comma-separated list, dropping blank entries.
#[must_use]
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "Yes").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn parse_list_drops_blanks() {
        assert_eq!(parse_list("a, b,,c "), vec!["a", "b", "c"]);
    }

    #[test]
    fn unset_variables_read_as_none() {
        assert_eq!(env_string("FLEETLB_TEST_SURELY_UNSET_VARIABLE"), None);
        assert_eq!(env_u64("FLEETLB_TEST_SURELY_UNSET_VARIABLE").unwrap(), None);
    }
}
