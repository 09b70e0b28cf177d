//! Host configuration
//!
//! Library defaults with runtime environment overrides, same shape as every
//! other knob set in this workspace.
//!
//! # Example
//!
//! ```rust,ignore
//! use bgserve_runtime::config::HostConfig;
//!
//! // Defaults with env overrides
//! let config = HostConfig::from_env();
//!
//! // Or programmatically
//! let config = HostConfig::new()
//!     .max_servers(4)
//!     .join_timeout(Some(Duration::from_secs(5)));
//! ```

pub mod defaults;

use std::time::Duration;

use bgserve_core::env::{env_get, env_get_bool, env_get_duration_ms, env_get_opt};

/// Process-wide settings shared by every service a host starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Registry capacity
    pub max_servers: usize,
    /// Blocking-mode interrupt poll interval
    pub poll_interval: Duration,
    /// Bytes read from a log channel per dispatch
    pub log_buffer_size: usize,
    /// Longest unterminated log line kept before it is flushed
    pub max_log_line: usize,
    /// Bound on shutdown joins; `None` waits for the worker however long
    pub join_timeout: Option<Duration>,
    /// Install SIG_IGN for SIGPIPE when the host is created
    pub ignore_sigpipe: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl HostConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `BGSERVE_MAX_SERVERS` - Registry slots
    /// - `BGSERVE_POLL_INTERVAL_MS` - Blocking loop interval (100-250)
    /// - `BGSERVE_LOG_BUFFER` - Log read size in bytes
    /// - `BGSERVE_MAX_LOG_LINE` - Longest buffered partial line
    /// - `BGSERVE_JOIN_TIMEOUT_MS` - Bounded shutdown join (unset = unbounded)
    /// - `BGSERVE_IGNORE_SIGPIPE` - Ignore SIGPIPE (0/1)
    pub fn from_env() -> Self {
        Self::new()
            .max_servers(env_get("BGSERVE_MAX_SERVERS", defaults::MAX_SERVERS))
            .poll_interval(env_get_duration_ms(
                "BGSERVE_POLL_INTERVAL_MS",
                defaults::POLL_INTERVAL_MS,
            ))
            .log_buffer_size(env_get("BGSERVE_LOG_BUFFER", defaults::LOG_BUFFER_SIZE))
            .max_log_line(env_get("BGSERVE_MAX_LOG_LINE", defaults::MAX_LOG_LINE))
            .join_timeout(env_get_opt::<u64>("BGSERVE_JOIN_TIMEOUT_MS").map(Duration::from_millis))
            .ignore_sigpipe(env_get_bool("BGSERVE_IGNORE_SIGPIPE", defaults::IGNORE_SIGPIPE))
    }

    /// Library defaults, no environment lookups.
    /// Useful for tests.
    pub fn new() -> Self {
        Self {
            max_servers: defaults::MAX_SERVERS,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            log_buffer_size: defaults::LOG_BUFFER_SIZE,
            max_log_line: defaults::MAX_LOG_LINE,
            join_timeout: None,
            ignore_sigpipe: defaults::IGNORE_SIGPIPE,
        }
    }

    // Builder methods

    pub fn max_servers(mut self, n: usize) -> Self {
        self.max_servers = n.max(1);
        self
    }

    /// Clamped to 100-250 ms
    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d.clamp(
            Duration::from_millis(defaults::POLL_INTERVAL_MIN_MS),
            Duration::from_millis(defaults::POLL_INTERVAL_MAX_MS),
        );
        self
    }

    pub fn log_buffer_size(mut self, bytes: usize) -> Self {
        self.log_buffer_size = bytes.max(1);
        self
    }

    pub fn max_log_line(mut self, bytes: usize) -> Self {
        self.max_log_line = bytes.max(1);
        self
    }

    pub fn join_timeout(mut self, d: Option<Duration>) -> Self {
        self.join_timeout = d;
        self
    }

    pub fn ignore_sigpipe(mut self, enable: bool) -> Self {
        self.ignore_sigpipe = enable;
        self
    }
}
