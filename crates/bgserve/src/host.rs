//! `ServeHost`, the embedder-facing API
//!
//! A host owns the registry, the dispatch thread's event loop and the log
//! bridge, and the embedded runtime every service runs. It lives on the
//! dispatch thread (it is `!Send`). The [`ServerHandle`]s it returns are
//! `Send + Sync` and may be shut down from anywhere; only log callbacks
//! are tied to the host's thread.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::error::Error;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bgserve_core::auth::AuthAction;
use bgserve_core::config::ServeConfig;
use bgserve_core::error::ServeResult;
use bgserve_core::info::ServerInfo;
use bgserve_core::interrupt::InterruptProbe;
use bgserve_core::runtime::EmbeddedRuntime;
use bgserve_core::state::AuthStatus;
use bgserve_runtime::{
    ignore_sigpipe, run_blocking, BlockingExit, EventLoop, HostConfig, LogBridge, LogCallback,
    LogHandlerRef, PendingServer, ServerHandle, ServerRegistry, SignalInterrupt, UserData,
};
use tracing::{debug, trace};

/// How to start one service
#[derive(Default)]
pub struct StartOptions {
    blocking: bool,
    log: Option<(LogCallback, Option<UserData>)>,
    interrupt: Option<Box<dyn InterruptProbe>>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the caller until the service is interrupted or exits
    pub fn blocking(mut self, enable: bool) -> Self {
        self.blocking = enable;
        self
    }

    /// Forward runtime log lines to `callback` on the dispatch thread
    pub fn on_log<F>(self, callback: F) -> Self
    where
        F: FnMut(&LogHandlerRef, &str, Option<&dyn Any>) -> Result<(), Box<dyn Error>> + 'static,
    {
        self.on_log_with(callback, None)
    }

    /// Like `on_log`, with user data handed back on every call
    pub fn on_log_with<F>(mut self, callback: F, user_data: Option<UserData>) -> Self
    where
        F: FnMut(&LogHandlerRef, &str, Option<&dyn Any>) -> Result<(), Box<dyn Error>> + 'static,
    {
        self.log = Some((Box::new(callback), user_data));
        self
    }

    /// Interrupt source for blocking mode. Defaults to SIGINT/SIGTERM.
    pub fn interrupt<P: InterruptProbe + 'static>(mut self, probe: P) -> Self {
        self.interrupt = Some(Box::new(probe));
        self
    }
}

/// Result of [`ServeHost::start`]
#[derive(Debug)]
pub enum Started {
    /// Running in the background
    Background(ServerHandle),
    /// Blocking start returned; the service is stopped and released
    Stopped(BlockingExit),
}

impl Started {
    pub fn handle(&self) -> Option<&ServerHandle> {
        match self {
            Started::Background(h) => Some(h),
            Started::Stopped(_) => None,
        }
    }

    pub fn into_handle(self) -> Option<ServerHandle> {
        match self {
            Started::Background(h) => Some(h),
            Started::Stopped(_) => None,
        }
    }
}

/// Starts, lists, authenticates and stops background services
pub struct ServeHost {
    config: HostConfig,
    registry: ServerRegistry,
    bridge: LogBridge,
    runtime: Arc<dyn EmbeddedRuntime>,
    /// Log handlers attached by `start`, by server id
    attached: RefCell<HashMap<u64, LogHandlerRef>>,
}

impl ServeHost {
    /// Host configured from the environment
    pub fn new(runtime: Arc<dyn EmbeddedRuntime>) -> Self {
        Self::with_config(runtime, HostConfig::from_env())
    }

    pub fn with_config(runtime: Arc<dyn EmbeddedRuntime>, config: HostConfig) -> Self {
        let registry = ServerRegistry::with_config(&config);
        Self::with_registry(runtime, config, registry)
    }

    /// Share a registry with other hosts or threads
    pub fn with_registry(
        runtime: Arc<dyn EmbeddedRuntime>,
        config: HostConfig,
        registry: ServerRegistry,
    ) -> Self {
        if config.ignore_sigpipe {
            ignore_sigpipe();
        }
        let bridge = LogBridge::new(EventLoop::new(), &config);
        debug!(capacity = registry.capacity(), "serve host created");
        Self {
            config,
            registry,
            bridge,
            runtime,
            attached: RefCell::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn event_loop(&self) -> &EventLoop {
        self.bridge.event_loop()
    }

    pub fn log_bridge(&self) -> &LogBridge {
        &self.bridge
    }

    /// Start a service.
    ///
    /// The log handler and the seeded auth context are in place before the
    /// worker thread exists. In blocking mode the call returns only after
    /// the worker has been joined, and the event loop keeps running
    /// meanwhile so log callbacks still fire.
    pub fn start(&self, config: ServeConfig, options: StartOptions) -> ServeResult<Started> {
        let StartOptions {
            blocking,
            log,
            interrupt,
        } = options;

        let mut pending = PendingServer::new(&self.registry, config, log.is_some())?;
        let id = pending.id();
        let handler = match (log, pending.take_log_reader()) {
            (Some((callback, user_data)), Some(fd)) => Some(self.bridge.attach(id, fd, callback, user_data)?),
            _ => None,
        };

        let handle = match pending.spawn(Arc::clone(&self.runtime)) {
            Ok(h) => h,
            Err(e) => {
                if let Some(h) = handler {
                    h.remove();
                }
                return Err(e);
            }
        };
        if let Some(h) = handler {
            self.attached.borrow_mut().insert(id, h);
        }

        if !blocking {
            return Ok(Started::Background(handle));
        }

        let probe: Box<dyn InterruptProbe> = match interrupt {
            Some(p) => p,
            None => Box::new(SignalInterrupt::install()?),
        };
        let exit = run_blocking(&handle, &*probe, self.config.poll_interval, |interval| {
            self.tick(interval)
        })?;
        self.finish_logs(id);
        Ok(Started::Stopped(exit))
    }

    /// Every running service
    pub fn list(&self) -> Vec<ServerInfo> {
        self.registry.snapshot()
    }

    /// Stop a service, deliver its last log lines, detach its handler.
    ///
    /// Bounded by `HostConfig::join_timeout` when set.
    pub fn shutdown(&self, handle: &ServerHandle) -> ServeResult<()> {
        match self.config.join_timeout {
            Some(limit) => handle.shutdown_timeout(limit)?,
            None => handle.shutdown()?,
        }
        self.finish_logs(handle.id());
        Ok(())
    }

    /// Deliver lines read from `fd` to `callback` on this thread
    pub fn register_log_handler<F>(
        &self,
        fd: OwnedFd,
        callback: F,
        user_data: Option<UserData>,
    ) -> ServeResult<LogHandlerRef>
    where
        F: FnMut(&LogHandlerRef, &str, Option<&dyn Any>) -> Result<(), Box<dyn Error>> + 'static,
    {
        Ok(self.bridge.register_log_handler(fd, callback, user_data)?)
    }

    /// Returns whether a registered handler was removed
    pub fn remove_log_handler(&self, handler: &LogHandlerRef) -> bool {
        self.bridge.remove_log_handler(handler)
    }

    /// Handler attached to `handle` by `start`, while it is delivering
    pub fn log_handler(&self, handle: &ServerHandle) -> Option<LogHandlerRef> {
        self.attached.borrow().get(&handle.id()).cloned()
    }

    pub fn manage_auth(&self, handle: &ServerHandle, key: &str, action: AuthAction) -> ServeResult<AuthStatus> {
        handle.manage_auth(key, action)
    }

    pub fn list_auth_keys(&self, handle: &ServerHandle) -> ServeResult<Vec<String>> {
        handle.list_auth_keys()
    }

    pub fn seed_auth_keys<I, K>(&self, handle: &ServerHandle, keys: I) -> ServeResult<AuthStatus>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        handle.seed_auth_keys(keys)
    }

    /// Run the event loop once, dispatching ready log handlers
    pub fn run_once(&self, timeout: Option<Duration>) -> ServeResult<usize> {
        let n = self.bridge.event_loop().run_once(timeout)?;
        self.prune();
        Ok(n)
    }

    /// Dispatch until nothing arrives for `idle`
    pub fn run_until_idle(&self, idle: Duration) -> ServeResult<usize> {
        let n = self.bridge.event_loop().run_until_idle(idle)?;
        self.prune();
        Ok(n)
    }

    fn tick(&self, interval: Duration) {
        if let Err(e) = self.run_once(Some(interval)) {
            trace!(error = %e, "event loop poll failed");
            thread::sleep(interval);
        }
    }

    /// Forget handlers whose stream already ended
    fn prune(&self) {
        self.attached.borrow_mut().retain(|_, h| h.is_active());
    }

    fn finish_logs(&self, server: u64) {
        // Take it out first: callbacks may call back into the host
        let handler = self.attached.borrow_mut().remove(&server);
        if let Some(h) = handler {
            let n = h.drain();
            h.remove();
            trace!(server, drained = n, "log handler detached");
        }
    }
}
