//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.
//!
//! ```ignore
//! use strand_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("STRAND_WORKERS", 4);
//! let hook: bool = env_get_bool("STRAND_HOOK_IO", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Works with any type that implements `FromStr`; parse failures fall
/// back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Everything else (including unset) returns the default when unset,
/// false when set to any other value.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__STRAND_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_parse_failure() {
        std::env::set_var("__STRAND_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__STRAND_TEST_BAD__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__STRAND_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool() {
        assert!(env_get_bool("__STRAND_TEST_UNSET__", true));
        assert!(!env_get_bool("__STRAND_TEST_UNSET__", false));

        std::env::set_var("__STRAND_TEST_BOOL__", "on");
        assert!(env_get_bool("__STRAND_TEST_BOOL__", false));
        std::env::set_var("__STRAND_TEST_BOOL__", "0");
        assert!(!env_get_bool("__STRAND_TEST_BOOL__", true));
        std::env::remove_var("__STRAND_TEST_BOOL__");
    }
}
