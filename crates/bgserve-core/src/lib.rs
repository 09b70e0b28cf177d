//! # bgserve-core
//!
//! Core types and traits for hosting embedded servers on background threads.
//!
//! This crate holds no threads, pipes or event loops. Those live in
//! `bgserve-runtime`. What is here is shared by both sides of the boundary:
//! the host that starts and stops services, and the embedded runtime that
//! serves until told to stop.
//!
//! ## Modules
//!
//! - `config` - Per-service configuration, validation and normalization
//! - `state` - Lifecycle state, auth status and log mode enums
//! - `auth` - Auth command wire format and the local key mirror
//! - `info` - Snapshot of a running service as reported by `list()`
//! - `interrupt` - Host interrupt probes for blocking mode
//! - `runtime` - The embedded runtime entry point (unix only)
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod auth;
pub mod config;
pub mod env;
pub mod error;
pub mod info;
pub mod interrupt;
pub mod state;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod runtime;
        pub use runtime::{EmbeddedRuntime, RuntimeResult, ServeParams};
    }
}

// Re-exports for convenience
pub use auth::{AuthAction, AuthCommand, KeyMirror};
pub use config::{Mount, ServeConfig};
pub use env::{env_get, env_get_bool, env_get_duration_ms, env_get_opt};
pub use error::{ChannelKind, Exhaustion, ServeError, ServeResult};
pub use info::ServerInfo;
pub use interrupt::{InterruptFlag, InterruptProbe, NeverInterrupt};
pub use state::{AuthStatus, LogMode, ServiceState};

/// Wire-level constants shared with embedded runtimes
pub mod constants {
    /// Byte written to the shutdown channel to request a stop
    pub const SHUTDOWN_SENTINEL: u8 = b'x';

    /// Bind address used when a configuration leaves it empty
    pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";

    /// Directory served when a mount leaves it empty
    pub const DEFAULT_DIR: &str = ".";
}
