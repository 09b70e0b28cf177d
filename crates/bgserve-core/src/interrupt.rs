//! Host interrupt probes
//!
//! In blocking mode the caller's thread sits in a polling loop. Each round
//! it asks an [`InterruptProbe`] whether the host wants out. A pending
//! interrupt is consumed by the check, so one interrupt stops one loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source of host interrupt requests
pub trait InterruptProbe {
    /// Return true at most once per interrupt
    fn interrupt_pending(&self) -> bool;
}

/// Shared flag that any thread can raise
///
/// Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag {
    raised: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt
    #[inline]
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Peek without consuming
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }
}

impl InterruptProbe for InterruptFlag {
    #[inline]
    fn interrupt_pending(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }
}

/// Probe that never fires; the loop ends only when the worker exits
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverInterrupt;

impl InterruptProbe for NeverInterrupt {
    #[inline]
    fn interrupt_pending(&self) -> bool {
        false
    }
}

impl<P: InterruptProbe + ?Sized> InterruptProbe for Box<P> {
    fn interrupt_pending(&self) -> bool {
        (**self).interrupt_pending()
    }
}

impl<P: InterruptProbe + ?Sized> InterruptProbe for Arc<P> {
    fn interrupt_pending(&self) -> bool {
        (**self).interrupt_pending()
    }
}
