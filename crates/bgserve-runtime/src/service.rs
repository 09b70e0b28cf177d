//! Service handles and the lifecycle state machine
//!
//! A service is started in two steps so the host can attach its side of
//! the log channel before any thread exists:
//!
//! 1. [`PendingServer::new`] validates the configuration, creates the
//!    shutdown/log/auth pipes, seeds the auth mirror and claims a registry
//!    slot (`Created -> Starting`).
//! 2. [`PendingServer::spawn`] starts the worker thread and returns a
//!    [`ServerHandle`] (`Starting -> Running`).
//!
//! Dropping a `PendingServer` that was never spawned, or a failed spawn,
//! releases everything it claimed.
//!
//! # Shutdown
//!
//! `shutdown` is idempotent and safe to race. The caller that moves the
//! service `Running -> Stopping` writes the sentinel. The caller that takes
//! the worker's join handle joins it, then releases the channels and the
//! registry slot. Nothing is released while the worker may still run. The
//! last clone of a handle finalizes with the same sequence.
//!
//! # Worker exit
//!
//! The worker keeps a duplicate of its shutdown and auth read ends until
//! it has marked the service `Stopped` under the registry lock. Every host
//! write that observed `Running` therefore still has a reader.

use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bgserve_core::auth::{AuthAction, AuthCommand};
use bgserve_core::config::ServeConfig;
use bgserve_core::error::{ChannelKind, Exhaustion, ServeError, ServeResult};
use bgserve_core::info::ServerInfo;
use bgserve_core::runtime::{EmbeddedRuntime, ServeParams};
use bgserve_core::state::{AuthStatus, LogMode, ServiceState};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::auth::AuthContext;
use crate::channel::{self, CommandSender, SignalSender};
use crate::registry::ServerRegistry;

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

fn next_server_id() -> u64 {
    NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed)
}

/// State shared by the registry, the handle and the worker
pub struct ServiceRecord {
    id: u64,
    config: ServeConfig,
    /// Written only under the registry lock
    state: AtomicU8,
    log_mode: LogMode,
    auth: Option<Mutex<AuthContext>>,
    worker_exited: Mutex<bool>,
    exit_cv: Condvar,
}

impl ServiceRecord {
    #[cfg(test)]
    pub(crate) fn new(config: ServeConfig, log_mode: LogMode, auth: Option<AuthContext>) -> Self {
        Self::with_id(next_server_id(), config, log_mode, auth)
    }

    fn with_id(id: u64, config: ServeConfig, log_mode: LogMode, auth: Option<AuthContext>) -> Self {
        Self {
            id,
            config,
            state: AtomicU8::new(ServiceState::Created as u8),
            log_mode,
            auth: auth.map(Mutex::new),
            worker_exited: Mutex::new(false),
            exit_cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ServiceState {
        ServiceState::from(self.state.load(Ordering::Acquire))
    }

    /// Caller holds the registry lock
    #[inline]
    pub(crate) fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn auth_status(&self) -> AuthStatus {
        match &self.auth {
            Some(ctx) => ctx.lock().status(),
            None => AuthStatus::Disabled,
        }
    }

    pub(crate) fn info(&self, slot: usize, state: ServiceState) -> ServerInfo {
        ServerInfo {
            id: self.id,
            slot,
            state,
            mounts: self.config.mounts.clone(),
            addr: self.config.addr.clone(),
            tls: self.config.tls,
            log_mode: self.log_mode,
            auth: self.auth_status(),
        }
    }

    fn mark_worker_exited(&self) {
        *self.worker_exited.lock() = true;
        self.exit_cv.notify_all();
    }

    /// Wait up to `timeout` for the worker to finish. Returns whether it did.
    fn wait_worker_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exited = self.worker_exited.lock();
        while !*exited {
            if self.exit_cv.wait_until(&mut exited, deadline).timed_out() {
                return *exited;
            }
        }
        true
    }

    fn detach_auth(&self) {
        if let Some(ctx) = &self.auth {
            ctx.lock().detach();
        }
    }
}

/// A registered service whose worker has not been spawned yet
pub struct PendingServer {
    record: Arc<ServiceRecord>,
    slot: usize,
    registry: ServerRegistry,
    shutdown_tx: Option<SignalSender>,
    shutdown_rx: Option<OwnedFd>,
    log_rx: Option<OwnedFd>,
    log_tx: Option<OwnedFd>,
    auth_rx: Option<OwnedFd>,
    /// Read ends the worker keeps open until it has marked itself stopped
    holds: Vec<OwnedFd>,
    spawned: bool,
}

fn channel_err(kind: ChannelKind) -> impl FnOnce(std::io::Error) -> ServeError {
    move |source| Exhaustion::Channel { kind, source }.into()
}

impl PendingServer {
    /// Validate, create channels, seed auth and claim a registry slot.
    ///
    /// With `forward_logs` set (and the config not silent) a log pipe is
    /// created and its read end is available from
    /// [`take_log_reader`](Self::take_log_reader).
    pub fn new(registry: &ServerRegistry, mut config: ServeConfig, forward_logs: bool) -> ServeResult<Self> {
        config.validate()?;
        config.normalize();

        let (shutdown_rx, shutdown_tx) =
            channel::signal_channel().map_err(channel_err(ChannelKind::Shutdown))?;
        let mut holds = vec![shutdown_rx.try_clone().map_err(channel_err(ChannelKind::Shutdown))?];

        let log_mode = if config.silent {
            LogMode::Silent
        } else if forward_logs {
            LogMode::Callback
        } else {
            LogMode::Console
        };
        let (log_rx, log_tx) = if log_mode == LogMode::Callback {
            let (rx, tx) = channel::pipe().map_err(channel_err(ChannelKind::Log))?;
            (Some(rx), Some(tx))
        } else {
            (None, None)
        };

        let id = next_server_id();
        let mut auth_rx = None;
        let mut auth_ctx = None;
        if config.auth {
            let (rx, tx) = channel::pipe().map_err(channel_err(ChannelKind::Auth))?;
            holds.push(rx.try_clone().map_err(channel_err(ChannelKind::Auth))?);
            auth_rx = Some(rx);
            let sender = CommandSender::new(tx).map_err(channel_err(ChannelKind::Auth))?;
            let mut ctx = AuthContext::new(id, sender);
            // What the pipe cannot hold yet is flushed once the worker runs
            ctx.prime(&config.auth_keys)?;
            auth_ctx = Some(ctx);
        }

        let record = Arc::new(ServiceRecord::with_id(id, config, log_mode, auth_ctx));

        let slot = registry.add(&record)?;
        registry.transition(&record, &[ServiceState::Created], ServiceState::Starting);

        Ok(Self {
            record,
            slot,
            registry: registry.clone(),
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx: Some(shutdown_rx),
            log_rx,
            log_tx,
            auth_rx,
            holds,
            spawned: false,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.record.id
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn log_mode(&self) -> LogMode {
        self.record.log_mode
    }

    /// Host end of the log channel, if logs are forwarded
    pub fn take_log_reader(&mut self) -> Option<OwnedFd> {
        self.log_rx.take()
    }

    /// Start the worker thread running `runtime`
    pub fn spawn(mut self, runtime: Arc<dyn EmbeddedRuntime>) -> ServeResult<ServerHandle> {
        let shutdown = self
            .shutdown_rx
            .take()
            .ok_or(ServeError::ChannelBroken(ChannelKind::Shutdown))?;
        let cfg = &self.record.config;
        let params = ServeParams {
            server_id: self.record.id,
            mounts: cfg.mounts.clone(),
            addr: cfg.addr.clone(),
            cors: cfg.cors,
            coop: cfg.coop,
            tls: cfg.tls,
            silent: cfg.silent,
            cert_file: cfg.cert_file.clone(),
            key_file: cfg.key_file.clone(),
            shutdown,
            log: self.log_tx.take(),
            auth: self.auth_rx.take(),
        };

        let record = Arc::clone(&self.record);
        let registry = self.registry.clone();
        let holds = std::mem::take(&mut self.holds);
        let spawned = thread::Builder::new()
            .name(format!("bgserve-{}", self.slot))
            .spawn(move || worker_main(runtime, params, record, registry, holds));

        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                error!(server = self.record.id, error = %e, "failed to spawn worker");
                // Drop releases the slot and channels
                return Err(ServeError::SpawnFailed(e));
            }
        };
        self.spawned = true;
        if let Some(auth) = &self.record.auth {
            if auth.lock().flush() == AuthStatus::Broken {
                warn!(server = self.record.id, "initial auth keys not fully delivered");
            }
        }
        self.registry
            .transition(&self.record, &[ServiceState::Starting], ServiceState::Running);
        info!(
            server = self.record.id,
            slot = self.slot,
            url = %format!("{}://{}", self.record.config.scheme(), self.record.config.addr),
            dirs = self.record.config.mounts.len(),
            "server started"
        );

        Ok(ServerHandle {
            inner: Arc::new(HandleInner {
                record: Arc::clone(&self.record),
                slot: self.slot,
                registry: self.registry.clone(),
                shutdown_tx: Mutex::new(self.shutdown_tx.take()),
                worker: Mutex::new(Some(join)),
                released: AtomicBool::new(false),
            }),
        })
    }
}

impl Drop for PendingServer {
    fn drop(&mut self) {
        if self.spawned {
            return;
        }
        self.registry.transition(
            &self.record,
            &[ServiceState::Created, ServiceState::Starting],
            ServiceState::Stopped,
        );
        self.record.detach_auth();
        self.registry.remove(&self.record);
        debug!(server = self.record.id, "start abandoned, resources released");
    }
}

fn worker_main(
    runtime: Arc<dyn EmbeddedRuntime>,
    params: ServeParams,
    record: Arc<ServiceRecord>,
    registry: ServerRegistry,
    holds: Vec<OwnedFd>,
) {
    let id = record.id;
    debug!(server = id, "worker running");
    match panic::catch_unwind(AssertUnwindSafe(|| runtime.serve(params))) {
        Ok(Ok(())) => debug!(server = id, "runtime returned"),
        Ok(Err(e)) => warn!(server = id, error = %e, "runtime failed"),
        Err(_) => error!(server = id, "runtime panicked"),
    }
    if registry.transition(
        &record,
        &[ServiceState::Starting, ServiceState::Running],
        ServiceState::Stopped,
    ) {
        info!(server = id, "server exited on its own");
    }
    drop(holds);
    record.mark_worker_exited();
}

/// Owner of one running service. Clones share the service.
///
/// `Send + Sync`: any thread may shut it down or manage its auth keys.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    record: Arc<ServiceRecord>,
    slot: usize,
    registry: ServerRegistry,
    shutdown_tx: Mutex<Option<SignalSender>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl ServerHandle {
    /// Start without log forwarding
    pub fn start(
        registry: &ServerRegistry,
        runtime: Arc<dyn EmbeddedRuntime>,
        config: ServeConfig,
    ) -> ServeResult<Self> {
        PendingServer::new(registry, config, false)?.spawn(runtime)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.record.id
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.inner.slot
    }

    #[inline]
    pub fn state(&self) -> ServiceState {
        self.inner.record.state()
    }

    /// True until the worker is gone or shutdown began
    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ServiceState::Starting | ServiceState::Running)
    }

    /// Channels closed and slot freed
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ServeConfig {
        &self.inner.record.config
    }

    pub fn log_mode(&self) -> LogMode {
        self.inner.record.log_mode
    }

    pub fn auth_status(&self) -> AuthStatus {
        self.inner.record.auth_status()
    }

    pub fn info(&self) -> ServerInfo {
        self.inner.record.info(self.inner.slot, self.state())
    }

    /// Signal, join and release. Idempotent.
    pub fn shutdown(&self) -> ServeResult<()> {
        self.inner.stop(None)
    }

    /// Like `shutdown`, but give up after `timeout` with `JoinTimeout`.
    ///
    /// On timeout the worker stays owned by the handle and nothing is
    /// released; a later `shutdown` (or the finalizer) joins it. While
    /// this call is waiting it holds the join handle, so a concurrent
    /// `shutdown` returns `Ok(())` at once without joining; the service is
    /// released by whichever call completes the join.
    pub fn shutdown_timeout(&self, timeout: Duration) -> ServeResult<()> {
        self.inner.stop(Some(timeout))
    }

    /// Send one auth command and update the mirror
    pub fn manage_auth(&self, key: &str, action: AuthAction) -> ServeResult<AuthStatus> {
        let cmd = AuthCommand::new(action, key)?;
        let ctx = self.auth()?;
        let status = ctx.lock().apply(&cmd);
        Ok(status)
    }

    /// The host's mirror of the key set
    pub fn list_auth_keys(&self) -> ServeResult<Vec<String>> {
        Ok(self.auth()?.lock().keys())
    }

    /// `ADD` each key
    pub fn seed_auth_keys<I, K>(&self, keys: I) -> ServeResult<AuthStatus>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.auth()?.lock().seed(keys)
    }

    fn auth(&self) -> ServeResult<&Mutex<AuthContext>> {
        self.inner.record.auth.as_ref().ok_or(ServeError::AuthNotEnabled)
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("id", &self.id())
            .field("slot", &self.slot())
            .field("state", &self.state())
            .finish()
    }
}

impl HandleInner {
    fn stop(&self, timeout: Option<Duration>) -> ServeResult<()> {
        let id = self.record.id;
        if self.registry.transition(
            &self.record,
            &[ServiceState::Starting, ServiceState::Running],
            ServiceState::Stopping,
        ) {
            debug!(server = id, "signalling shutdown");
            if let Some(tx) = self.shutdown_tx.lock().as_ref() {
                if let Err(e) = tx.signal() {
                    debug!(server = id, error = %e, "shutdown signal not delivered, worker already gone");
                }
            }
        }

        let Some(join) = self.worker.lock().take() else {
            return Ok(());
        };
        if let Some(limit) = timeout {
            if !self.record.wait_worker_exit(limit) {
                *self.worker.lock() = Some(join);
                warn!(server = id, timeout = ?limit, "worker still running after shutdown timeout");
                return Err(ServeError::JoinTimeout(limit));
            }
        }
        if join.join().is_err() {
            warn!(server = id, "worker thread panicked");
        }
        self.release();
        Ok(())
    }

    /// Caller has joined the worker
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.transition(
            &self.record,
            &[ServiceState::Starting, ServiceState::Running, ServiceState::Stopping],
            ServiceState::Stopped,
        );
        self.shutdown_tx.lock().take();
        self.record.detach_auth();
        self.registry.remove(&self.record);
        info!(server = self.record.id, "server stopped");
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        debug!(server = self.record.id, "finalizing unreleased handle");
        if let Err(e) = self.stop(None) {
            warn!(server = self.record.id, error = %e, "finalize failed");
        }
    }
}
