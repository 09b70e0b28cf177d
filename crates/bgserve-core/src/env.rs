//! Environment variable utilities
//!
//! Host-wide knobs are read once at startup with `env_get` and friends.
//! A variable that is unset or fails to parse falls back to the default.
//!
//! ```ignore
//! use bgserve_core::env::{env_get, env_get_bool, env_get_duration_ms};
//!
//! let slots: usize = env_get("BGSERVE_MAX_SERVERS", 16);
//! let poll = env_get_duration_ms("BGSERVE_POLL_INTERVAL_MS", 200);
//! let quiet = env_get_bool("BGSERVE_IGNORE_SIGPIPE", true);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well-formed
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag
///
/// "1", "true", "yes", "on" are true and "0", "false", "no", "off" are
/// false (case-insensitive). Anything else, including unset, is `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Millisecond count as a `Duration`
#[inline]
pub fn env_get_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}
