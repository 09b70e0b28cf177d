//! # bgserve
//!
//! Run embedded servers on background threads and manage them from the
//! host thread.
//!
//! ```ignore
//! use std::sync::Arc;
//! use bgserve::{PipeRuntime, ServeConfig, ServeHost, StartOptions};
//!
//! let host = ServeHost::new(Arc::new(PipeRuntime::new()));
//! let started = host.start(
//!     ServeConfig::new().mount("/srv/www", "/"),
//!     StartOptions::new().on_log(|_h, line, _| {
//!         print!("{line}");
//!         Ok(())
//!     }),
//! )?;
//!
//! for info in host.list() {
//!     println!("{info}");
//! }
//! if let Some(handle) = started.handle() {
//!     host.shutdown(handle)?;
//! }
//! ```
//!
//! ## Crates
//!
//! - `bgserve-core` - configuration, lifecycle state, auth wire format,
//!   the `EmbeddedRuntime` trait
//! - `bgserve-runtime` - pipes, registry, worker threads, the log bridge
//!   and the blocking supervisor
//!
//! ## Configuration
//!
//! Host limits are read from the environment (see `HostConfig::from_env`):
//!
//! - `BGSERVE_MAX_SERVERS` - concurrent services (default 16)
//! - `BGSERVE_POLL_INTERVAL_MS` - blocking-mode interrupt poll (default 200)
//! - `BGSERVE_LOG_BUFFER` - log read buffer in bytes (default 4096)
//! - `BGSERVE_MAX_LOG_LINE` - longest undelimited log line (default 64K)
//! - `BGSERVE_JOIN_TIMEOUT_MS` - bound for `ServeHost::shutdown` (unset)
//! - `BGSERVE_IGNORE_SIGPIPE` - ignore SIGPIPE on host creation (default true)

#![cfg(unix)]

mod host;

pub use host::{ServeHost, StartOptions, Started};

pub use bgserve_core::{constants, env};
pub use bgserve_core::{
    AuthAction, AuthCommand, AuthStatus, EmbeddedRuntime, InterruptFlag, InterruptProbe, LogMode,
    Mount, NeverInterrupt, RuntimeResult, ServeConfig, ServeError, ServeParams, ServeResult,
    ServerInfo, ServiceState,
};
pub use bgserve_runtime::{
    BlockingExit, EventLoop, HostConfig, LogBridge, LogCallback, LogHandlerInfo, LogHandlerRef,
    PipeRuntime, ServerHandle, ServerRegistry, SignalInterrupt, UserData,
};
