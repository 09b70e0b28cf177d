//! Process signal handling
//!
//! SIGINT/SIGTERM become a polled [`SignalInterrupt`] probe for blocking
//! mode, for as long as a probe is alive. SIGPIPE is ignored so a write into a pipe whose reader is gone
//! fails with `EPIPE` instead of killing the host.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    }
}
