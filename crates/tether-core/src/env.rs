//! Environment variable utilities
//!
//! Generic parsing helpers used by the runtime configuration.
//!
//! # Usage
//!
//! ```ignore
//! use tether_core::env::{env_get, env_get_bool, env_get_list};
//!
//! let loops: usize = env_get("TETHER_POOL_SIZE", 4);
//! let debug: bool = env_get_bool("TETHER_DEBUG", false);
//! let weights: Vec<u32> = env_get_list("TETHER_QUEUE_WEIGHTS", vec![50, 25]);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Everything else returns false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get a comma-separated environment variable as a list
///
/// Falls back to the default if the variable is unset or any element
/// fails to parse.
pub fn env_get_list<T>(key: &str, default: Vec<T>) -> Vec<T>
where
    T: FromStr,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    parse_list(&raw).unwrap_or(default)
}

fn parse_list<T: FromStr>(raw: &str) -> Option<Vec<T>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("TETHER_TEST_SURELY_UNSET_VAR", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_env_get_bool_default() {
        assert!(env_get_bool("TETHER_TEST_SURELY_UNSET_BOOL", true));
        assert!(!env_get_bool("TETHER_TEST_SURELY_UNSET_BOOL", false));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list::<u32>("50, 25,10"), Some(vec![50, 25, 10]));
        assert_eq!(parse_list::<u32>("50,,25"), Some(vec![50, 25]));
        assert_eq!(parse_list::<u32>("50,x"), None);
        assert_eq!(parse_list::<u32>(""), Some(vec![]));
    }
}
