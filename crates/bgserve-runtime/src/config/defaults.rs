//! Library defaults for [`HostConfig`](super::HostConfig)

/// Registry slots
pub const MAX_SERVERS: usize = 16;

/// Blocking-mode interrupt poll interval
pub const POLL_INTERVAL_MS: u64 = 200;

/// Poll interval is clamped into this range
pub const POLL_INTERVAL_MIN_MS: u64 = 100;
pub const POLL_INTERVAL_MAX_MS: u64 = 250;

/// Bytes read from a log channel per dispatch
pub const LOG_BUFFER_SIZE: usize = 4096;

/// An unterminated log line is flushed once it grows this large
pub const MAX_LOG_LINE: usize = 64 * 1024;

/// Ignore SIGPIPE so writes to a closed pipe return EPIPE
pub const IGNORE_SIGPIPE: bool = true;
