//! Configuration loading from environment-style key/value lookups.
//!
//! Loaders take a lookup closure instead of reading `std::env` directly so the
//! same parsing is used by the binaries (`std::env::var`) and by tests (a map).

use core::fmt::Display;
use core::str::FromStr;

use jobqueue_core::QueueError;

/// Lookup backed by the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Parse `key` if present and non-empty.
pub fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, QueueError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| QueueError::configuration(format!("{key}: {e}"))),
        _ => Ok(None),
    }
}

/// Parse a comma-separated list if present and non-empty.
pub fn parse_list<T, F>(lookup: &F, key: &str) -> Result<Option<Vec<T>>, QueueError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key).filter(|raw| !raw.trim().is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse()
                .map_err(|e| QueueError::configuration(format!("{key}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Parse a boolean flag (`true/false`, `1/0`, `yes/no`, `on/off`).
pub fn parse_flag<F>(lookup: &F, key: &str) -> Result<Option<bool>, QueueError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key).filter(|raw| !raw.trim().is_empty()) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(QueueError::configuration(format!(
            "{key}: expected a boolean, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_and_blank_values_are_none() {
        let env = lookup(&[("BLANK", "  ")]);
        assert_eq!(parse_var::<u32, _>(&env, "MISSING").unwrap(), None);
        assert_eq!(parse_var::<u32, _>(&env, "BLANK").unwrap(), None);
    }

    #[test]
    fn bad_numbers_name_the_key() {
        let env = lookup(&[("N", "ten")]);
        let err = parse_var::<u32, _>(&env, "N").unwrap_err();
        assert!(err.to_string().contains("N:"), "{err}");
    }

    #[test]
    fn lists_are_trimmed() {
        let env = lookup(&[("L", " 1, 2 ,,3 ")]);
        assert_eq!(parse_list::<u32, _>(&env, "L").unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn flags_accept_common_spellings() {
        let env = lookup(&[("A", "YES"), ("B", "0"), ("C", "maybe")]);
        assert_eq!(parse_flag(&env, "A").unwrap(), Some(true));
        assert_eq!(parse_flag(&env, "B").unwrap(), Some(false));
        assert!(parse_flag(&env, "C").is_err());
    }
}
