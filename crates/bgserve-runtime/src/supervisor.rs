//! Blocking-mode supervisor
//!
//! When the host asks for a blocking start, its control thread parks here
//! instead of returning. Every `interval` it checks the interrupt probe
//! and the worker. An interrupt runs the normal shutdown sequence; a
//! worker that exits on its own is joined and released. Either way the
//! call returns only after the worker has been joined.
//!
//! The supervisor touches the worker only through the handle: the shutdown
//! channel and the shared state.

use std::thread;
use std::time::Duration;

use bgserve_core::error::ServeResult;
use bgserve_core::interrupt::InterruptProbe;
use tracing::info;

use crate::service::ServerHandle;

/// Why a blocking run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingExit {
    /// The host interrupted; shutdown was signalled
    Interrupted,
    /// The worker stopped by itself
    Exited,
}

/// Block until `probe` fires or the worker exits.
///
/// `tick` is called between checks with `interval` and is expected to
/// take about that long. [`sleep_tick`] just sleeps; a host with an event
/// loop passes a closure that runs it, so logs keep flowing while blocked.
pub fn run_blocking<P, T>(
    handle: &ServerHandle,
    probe: &P,
    interval: Duration,
    mut tick: T,
) -> ServeResult<BlockingExit>
where
    P: InterruptProbe + ?Sized,
    T: FnMut(Duration),
{
    let id = handle.id();
    info!(server = id, interval = ?interval, "blocking until interrupted");
    loop {
        if probe.interrupt_pending() {
            info!(server = id, "interrupt received, stopping server");
            handle.shutdown()?;
            return Ok(BlockingExit::Interrupted);
        }
        if !handle.is_running() {
            handle.shutdown()?;
            return Ok(BlockingExit::Exited);
        }
        tick(interval);
    }
}

/// Default tick
pub fn sleep_tick(interval: Duration) {
    thread::sleep(interval);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe_runtime::PipeRuntime;
    use crate::registry::ServerRegistry;
    use bgserve_core::config::ServeConfig;
    use bgserve_core::interrupt::{InterruptFlag, NeverInterrupt};
    use bgserve_core::runtime::{RuntimeResult, ServeParams};
    use bgserve_core::state::ServiceState;
    use std::sync::Arc;
    use std::time::Instant;

    fn config() -> ServeConfig {
        ServeConfig::new().mount("/srv", "/").silent(true)
    }

    #[test]
    fn test_interrupt_stops_and_joins() {
        crate::signal::ignore_sigpipe();
        let reg = ServerRegistry::new(2);
        let h = ServerHandle::start(&reg, Arc::new(PipeRuntime::new()), config()).unwrap();

        let flag = InterruptFlag::new();
        let remote = flag.clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.raise();
        });

        let started = Instant::now();
        let mut ticks = 0;
        let exit = run_blocking(&h, &flag, Duration::from_millis(100), |d| {
            ticks += 1;
            sleep_tick(d);
        })
        .unwrap();
        raiser.join().unwrap();

        assert_eq!(exit, BlockingExit::Interrupted);
        assert!(ticks >= 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(h.state(), ServiceState::Stopped);
        assert!(h.is_released());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_signal_before_blocking_run_does_not_interrupt_it() {
        use crate::signal::{SignalInterrupt, SIGNAL_TEST_LOCK};
        use nix::sys::signal::{raise, Signal};

        let _lock = SIGNAL_TEST_LOCK.lock();
        // Arrives while an earlier blocking run's handlers are installed
        let earlier = SignalInterrupt::install().unwrap();
        raise(Signal::SIGTERM).unwrap();
        drop(earlier);

        let reg = ServerRegistry::new(2);
        let runtime = Arc::new(|_p: ServeParams| -> RuntimeResult {
            thread::sleep(Duration::from_millis(150));
            Ok(())
        });
        let h = ServerHandle::start(&reg, runtime, config()).unwrap();
        let probe = SignalInterrupt::install().unwrap();
        let exit = run_blocking(&h, &probe, Duration::from_millis(100), sleep_tick).unwrap();
        assert_eq!(exit, BlockingExit::Exited);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_worker_exit_ends_blocking_run() {
        let reg = ServerRegistry::new(2);
        let runtime = Arc::new(|_p: ServeParams| -> RuntimeResult {
            thread::sleep(Duration::from_millis(30));
            Ok(())
        });
        let h = ServerHandle::start(&reg, runtime, config()).unwrap();

        let exit = run_blocking(&h, &NeverInterrupt, Duration::from_millis(100), sleep_tick).unwrap();
        assert_eq!(exit, BlockingExit::Exited);
        assert!(h.is_released());
        assert!(reg.is_empty());
    }
}
