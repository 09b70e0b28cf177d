//! Bounded registry of live services
//!
//! A fixed number of slots behind one lock. The same lock guards every
//! lifecycle transition, so `snapshot()` can never observe a service that
//! is half way between `Running` and `Stopping`. The lock is held only long
//! enough to test-and-set; joins and pipe writes happen outside it.

use std::sync::Arc;

use bgserve_core::error::{Exhaustion, ServeResult};
use bgserve_core::info::ServerInfo;
use bgserve_core::state::ServiceState;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::HostConfig;
use crate::service::ServiceRecord;

/// Shared, injectable table of services. Clones share the same table.
#[derive(Clone)]
pub struct ServerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    slots: Mutex<Vec<Option<Arc<ServiceRecord>>>>,
    capacity: usize,
}

impl ServerRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(vec![None; capacity]),
                capacity,
            }),
        }
    }

    pub fn with_config(config: &HostConfig) -> Self {
        Self::new(config.max_servers)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Occupied slots, in any state
    pub fn len(&self) -> usize {
        self.inner.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is a service with this id registered, in any state
    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .slots
            .lock()
            .iter()
            .flatten()
            .any(|r| r.id() == id)
    }

    /// Current state of a registered service
    pub fn state_of(&self, id: u64) -> Option<ServiceState> {
        self.inner
            .slots
            .lock()
            .iter()
            .flatten()
            .find(|r| r.id() == id)
            .map(|r| r.state())
    }

    /// Place `record` in the first free slot
    pub(crate) fn add(&self, record: &Arc<ServiceRecord>) -> ServeResult<usize> {
        let mut slots = self.inner.slots.lock();
        debug_assert!(
            !slots.iter().flatten().any(|r| Arc::ptr_eq(r, record)),
            "service registered twice"
        );
        match slots.iter().position(Option::is_none) {
            Some(slot) => {
                slots[slot] = Some(Arc::clone(record));
                debug!(server = record.id(), slot, "registered");
                Ok(slot)
            }
            None => Err(Exhaustion::RegistryFull {
                capacity: self.inner.capacity,
            }
            .into()),
        }
    }

    /// Clear the slot holding `record`. Returns false if it was not there.
    pub(crate) fn remove(&self, record: &ServiceRecord) -> bool {
        let mut slots = self.inner.slots.lock();
        for (slot, entry) in slots.iter_mut().enumerate() {
            if entry.as_deref().is_some_and(|r| std::ptr::eq(r, record)) {
                *entry = None;
                debug!(server = record.id(), slot, "unregistered");
                return true;
            }
        }
        false
    }

    /// Move `record` to `to` if its current state is one of `from`.
    /// Returns whether this call made the transition.
    pub(crate) fn transition(
        &self,
        record: &ServiceRecord,
        from: &[ServiceState],
        to: ServiceState,
    ) -> bool {
        let _slots = self.inner.slots.lock();
        let current = record.state();
        if from.contains(&current) && current.can_transition(to) {
            record.set_state(to);
            trace!(server = record.id(), from = %current, to = %to, "transition");
            true
        } else {
            false
        }
    }

    /// Every `Running` service, in slot order
    pub fn snapshot(&self) -> Vec<ServerInfo> {
        let running: Vec<(usize, Arc<ServiceRecord>)> = {
            let slots = self.inner.slots.lock();
            slots
                .iter()
                .enumerate()
                .filter_map(|(slot, r)| r.as_ref().map(|r| (slot, r)))
                .filter(|(_, r)| r.state().is_running())
                .map(|(slot, r)| (slot, Arc::clone(r)))
                .collect()
        };
        running
            .into_iter()
            .map(|(slot, r)| r.info(slot, ServiceState::Running))
            .collect()
    }
}
