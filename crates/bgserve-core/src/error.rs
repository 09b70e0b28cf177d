//! Error types for starting, stopping and talking to background services

use core::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for service operations
pub type ServeResult<T> = Result<T, ServeError>;

/// Errors that can occur in service operations
///
/// Configuration and resource errors are returned synchronously from
/// `start`. Channel errors that happen after a service is running never
/// surface here on their own; they show up later as a degraded status
/// (see [`AuthStatus`](crate::AuthStatus)).
#[derive(Debug, Error)]
pub enum ServeError {
    /// Rejected before anything was allocated
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Registry full or a channel could not be created
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] Exhaustion),

    /// The worker thread could not be created; everything was released
    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(#[source] io::Error),

    /// A post-start channel is closed or failed
    #[error("{0} channel broken")]
    ChannelBroken(ChannelKind),

    /// Auth operation on a service started without auth
    #[error("authentication is not enabled for this server")]
    AuthNotEnabled,

    /// Key is empty or cannot be framed on the wire
    #[error("invalid auth key: {0:?}")]
    InvalidAuthKey(String),

    /// Bounded shutdown gave up waiting; the worker is still owned
    #[error("worker did not exit within {0:?}")]
    JoinTimeout(Duration),

    /// Platform-specific error
    #[error("os error: {0}")]
    Os(#[from] io::Error),
}

impl ServeError {
    /// Registry full, as opposed to any other exhaustion
    pub fn is_registry_full(&self) -> bool {
        matches!(self, ServeError::ResourceExhausted(Exhaustion::RegistryFull { .. }))
    }
}

/// What ran out when a service could not be started
#[derive(Debug, Error)]
pub enum Exhaustion {
    #[error("server registry is full ({capacity} slots)")]
    RegistryFull { capacity: usize },

    #[error("could not create {kind} channel: {source}")]
    Channel {
        kind: ChannelKind,
        #[source]
        source: io::Error,
    },
}

/// The three channels a service owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Shutdown,
    Log,
    Auth,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Shutdown => write!(f, "shutdown"),
            ChannelKind::Log => write!(f, "log"),
            ChannelKind::Auth => write!(f, "auth"),
        }
    }
}
