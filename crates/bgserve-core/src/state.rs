//! Lifecycle state and status enums

use core::fmt;

/// Lifecycle state of a background service
///
/// ```text
/// Created -> Starting -> Running -> Stopping -> Stopped
///                |          |                     ^
///                |          +---- worker exits ---+
///                +------ spawn failure -----------+
/// ```
///
/// Transitions are test-and-set under the registry lock. `Stopped` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceState {
    /// Record built and registered, channels not yet handed to a worker
    Created = 0,

    /// Registered and channels created, worker not yet confirmed
    Starting = 1,

    /// Worker is serving
    Running = 2,

    /// Shutdown signalled, waiting for the worker to be joined
    Stopping = 3,

    /// Worker joined or never started
    Stopped = 4,
}

impl ServiceState {
    /// Check if the service is visible to `list()`
    #[inline]
    pub const fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// Check whether `self -> next` is an edge of the lifecycle graph
    pub const fn can_transition(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Stopped)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }
}

impl From<u8> for ServiceState {
    fn from(v: u8) -> Self {
        match v {
            0 => ServiceState::Created,
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

impl From<ServiceState> for u8 {
    fn from(state: ServiceState) -> u8 {
        state as u8
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Created => "created",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Health of a service's auth channel as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStatus {
    /// Service was started without auth
    Disabled,
    /// Every command so far reached the channel
    Synced,
    /// A write failed or the channel is closed; the mirror may diverge
    Broken,
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStatus::Disabled => f.write_str("disabled"),
            AuthStatus::Synced => f.write_str("enabled"),
            AuthStatus::Broken => f.write_str("enabled (channel broken)"),
        }
    }
}

/// Where a service's log output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogMode {
    /// Runtime asked to stay quiet
    Silent,
    /// Log channel drained into a host callback
    Callback,
    /// Runtime writes to its own console
    Console,
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMode::Silent => f.write_str("silent"),
            LogMode::Callback => f.write_str("callback"),
            LogMode::Console => f.write_str("console"),
        }
    }
}
