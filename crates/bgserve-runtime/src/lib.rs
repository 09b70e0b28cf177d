//! # bgserve-runtime
//!
//! Unix runtime for background services.
//!
//! This crate implements the threads, pipes and tables behind the types in
//! `bgserve-core`:
//!
//! - `channel` - Shutdown, log and auth pipes plus line framing
//! - `registry` - Bounded, lock-guarded table of live services
//! - `service` - Service handles, the worker thread, the lifecycle
//! - `auth` - Host side of the auth channel with its local mirror
//! - `event_loop` - Cooperative input-source loop for the dispatch thread
//! - `log_bridge` - Log handlers driven by the event loop
//! - `supervisor` - Blocking-mode interrupt loop
//! - `signal` - SIGINT/SIGTERM probe and SIGPIPE handling
//! - `pipe_runtime` - Reference embedded runtime (pipe protocol only)
//! - `config` - Host configuration with env overrides
//!
//! ## Threads
//!
//! One OS thread per service runs the embedded runtime. One dispatch
//! thread owns the [`EventLoop`] and runs every log callback. Control
//! calls (start, stop, list, auth) may come from any thread.

#![cfg(unix)]

pub mod auth;
pub mod channel;
pub mod config;
pub mod event_loop;
pub mod log_bridge;
pub mod pipe_runtime;
pub mod registry;
pub mod service;
pub mod signal;
pub mod supervisor;

// Re-exports for convenience
pub use auth::AuthContext;
pub use config::HostConfig;
pub use event_loop::{EventLoop, InputId};
pub use log_bridge::{LogBridge, LogCallback, LogHandlerInfo, LogHandlerRef, UserData};
pub use pipe_runtime::PipeRuntime;
pub use registry::ServerRegistry;
pub use service::{PendingServer, ServerHandle};
pub use signal::{ignore_sigpipe, SignalInterrupt};
pub use supervisor::{run_blocking, sleep_tick, BlockingExit};
