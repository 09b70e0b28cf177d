//! Unix signal handling: lock-free flag set from the handler, polled later
//!
//! The SIGINT/SIGTERM handlers are only in place while at least one
//! [`SignalInterrupt`] is alive. The first one saves the dispositions it
//! replaces, the last one to drop puts them back.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use bgserve_core::interrupt::InterruptProbe;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::{const_mutex, Mutex};
use tracing::{debug, warn};

const INTERRUPT_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

static RECEIVED_SIGNAL: AtomicUsize = AtomicUsize::new(0);
static SIGPIPE_IGNORED: Once = Once::new();
static INSTALLED: Mutex<Installed> = const_mutex(Installed {
    count: 0,
    previous: Vec::new(),
});

/// Serializes tests that raise or rewire SIGINT/SIGTERM
#[cfg(test)]
pub(crate) static SIGNAL_TEST_LOCK: Mutex<()> = const_mutex(());

struct Installed {
    /// Live `SignalInterrupt`s
    count: usize,
    /// Dispositions replaced by the first install
    previous: Vec<(Signal, SigAction)>,
}

extern "C" fn on_signal(sig: libc::c_int) {
    // Only async-signal-safe work here
    RECEIVED_SIGNAL.store(sig as usize, Ordering::SeqCst);
}

fn restore(previous: &[(Signal, SigAction)]) {
    for (sig, action) in previous.iter().rev() {
        // Safety: puts back a disposition the process had before
        if let Err(e) = unsafe { signal::sigaction(*sig, action) } {
            warn!(signal = %sig, error = %e, "could not restore signal disposition");
        }
    }
}

/// Take the last recorded signal, if any. Returns each signal once.
pub fn take_signal() -> Option<Signal> {
    match RECEIVED_SIGNAL.swap(0, Ordering::AcqRel) {
        0 => None,
        n => Signal::try_from(n as i32).ok(),
    }
}

/// Ignore SIGPIPE for the whole process. Runs once.
pub fn ignore_sigpipe() {
    SIGPIPE_IGNORED.call_once(|| {
        // Safety: SigIgn installs no Rust code as a handler
        match unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            Ok(_) => debug!("SIGPIPE ignored"),
            Err(e) => warn!(error = %e, "could not ignore SIGPIPE"),
        }
    });
}

/// Blocking-mode probe fired by Ctrl-C or SIGTERM.
///
/// Handlers are installed by [`install`](Self::install) and the previous
/// dispositions come back when the last probe is dropped.
#[derive(Debug)]
pub struct SignalInterrupt {
    _installed: (),
}

impl SignalInterrupt {
    /// Install the handlers and return a probe reading them.
    ///
    /// A signal left over from an earlier install is discarded.
    pub fn install() -> io::Result<Self> {
        let mut state = INSTALLED.lock();
        if state.count == 0 {
            RECEIVED_SIGNAL.store(0, Ordering::SeqCst);
            let action = SigAction::new(
                SigHandler::Handler(on_signal),
                SaFlags::empty(),
                SigSet::empty(),
            );
            let mut previous = Vec::with_capacity(INTERRUPT_SIGNALS.len());
            for sig in INTERRUPT_SIGNALS {
                // Safety: the handler only stores into an atomic
                match unsafe { signal::sigaction(sig, &action) } {
                    Ok(old) => previous.push((sig, old)),
                    Err(e) => {
                        restore(&previous);
                        return Err(io::Error::from(e));
                    }
                }
            }
            state.previous = previous;
            debug!("installed SIGINT/SIGTERM handlers");
        }
        state.count += 1;
        Ok(Self { _installed: () })
    }
}

impl Drop for SignalInterrupt {
    fn drop(&mut self) {
        let mut state = INSTALLED.lock();
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            let previous = std::mem::take(&mut state.previous);
            restore(&previous);
            debug!("restored SIGINT/SIGTERM dispositions");
        }
    }
}

impl InterruptProbe for SignalInterrupt {
    fn interrupt_pending(&self) -> bool {
        match take_signal() {
            Some(sig) => {
                debug!(signal = %sig, "interrupt received");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_handler(sig: Signal) -> SigHandler {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let old = unsafe { signal::sigaction(sig, &ignore) }.unwrap();
        unsafe { signal::sigaction(sig, &old) }.unwrap();
        old.handler()
    }

    #[test]
    fn test_raised_sigint_is_seen_once() {
        let _lock = SIGNAL_TEST_LOCK.lock();
        let probe = SignalInterrupt::install().unwrap();

        signal::raise(Signal::SIGINT).unwrap();
        assert!(probe.interrupt_pending());
        assert!(!probe.interrupt_pending());
    }

    #[test]
    fn test_nested_installs_keep_handlers_until_last_drop() {
        let _lock = SIGNAL_TEST_LOCK.lock();
        let outer = SignalInterrupt::install().unwrap();
        let inner = SignalInterrupt::install().unwrap();
        drop(outer);

        signal::raise(Signal::SIGTERM).unwrap();
        assert!(inner.interrupt_pending());
        assert_eq!(current_handler(Signal::SIGTERM), SigHandler::Handler(on_signal));
    }

    #[test]
    fn test_drop_restores_previous_disposition() {
        let _lock = SIGNAL_TEST_LOCK.lock();
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let original = unsafe { signal::sigaction(Signal::SIGINT, &ignore) }.unwrap();

        let probe = SignalInterrupt::install().unwrap();
        assert_eq!(current_handler(Signal::SIGINT), SigHandler::Handler(on_signal));
        drop(probe);
        assert_eq!(current_handler(Signal::SIGINT), SigHandler::SigIgn);

        // Ignored again, nothing latched
        signal::raise(Signal::SIGINT).unwrap();
        assert!(take_signal().is_none());

        unsafe { signal::sigaction(Signal::SIGINT, &original) }.unwrap();
    }

    #[test]
    fn test_signal_from_earlier_install_is_discarded() {
        let _lock = SIGNAL_TEST_LOCK.lock();
        let first = SignalInterrupt::install().unwrap();
        signal::raise(Signal::SIGINT).unwrap();
        drop(first);

        let second = SignalInterrupt::install().unwrap();
        assert!(!second.interrupt_pending());
    }

    #[test]
    fn test_ignore_sigpipe_is_idempotent() {
        ignore_sigpipe();
        ignore_sigpipe();
    }
}
