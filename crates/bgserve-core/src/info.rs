//! What `list()` reports about a running service

use core::fmt;

use crate::config::Mount;
use crate::state::{AuthStatus, LogMode, ServiceState};

/// Point-in-time view of one registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: u64,
    pub slot: usize,
    pub state: ServiceState,
    pub mounts: Vec<Mount>,
    pub addr: String,
    pub tls: bool,
    pub log_mode: LogMode,
    pub auth: AuthStatus,
}

impl ServerInfo {
    #[inline]
    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme(), self.addr)
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Server {} ({}): {}", self.id, self.state, self.url())?;
        for m in &self.mounts {
            writeln!(f, "  {m}")?;
        }
        write!(f, "  logging: {}, auth: {}", self.log_mode, self.auth)
    }
}
