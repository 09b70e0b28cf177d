//! The embedded server runtime entry point
//!
//! An embedded runtime is a blocking call that serves until its shutdown
//! descriptor becomes readable. It is handed three descriptors:
//!
//! - `shutdown` - read end; one sentinel byte means stop now
//! - `log` - write end for newline-terminated log lines (absent when the
//!   host did not attach a log handler)
//! - `auth` - read end of the auth command stream (absent when auth is off)
//!
//! The runtime owns all three and closes them by dropping them when it
//! returns. Closing `log` is how the host learns the stream has ended.

use std::error::Error;
use std::os::fd::OwnedFd;

use crate::config::Mount;

/// Outcome of one `serve` call
pub type RuntimeResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Everything an embedded runtime receives
#[derive(Debug)]
pub struct ServeParams {
    /// Host-assigned service id
    pub server_id: u64,
    pub mounts: Vec<Mount>,
    pub addr: String,
    pub cors: bool,
    pub coop: bool,
    pub tls: bool,
    pub silent: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub shutdown: OwnedFd,
    pub log: Option<OwnedFd>,
    pub auth: Option<OwnedFd>,
}

impl ServeParams {
    #[inline]
    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }
}

/// A blocking server loop run on a dedicated worker thread
pub trait EmbeddedRuntime: Send + Sync + 'static {
    /// Serve until `params.shutdown` is readable, then return
    fn serve(&self, params: ServeParams) -> RuntimeResult;
}

impl<F> EmbeddedRuntime for F
where
    F: Fn(ServeParams) -> RuntimeResult + Send + Sync + 'static,
{
    fn serve(&self, params: ServeParams) -> RuntimeResult {
        self(params)
    }
}
