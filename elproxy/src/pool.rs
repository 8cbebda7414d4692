use crate::net::relay::Slot;
use crate::registry::Registry;
use std::sync::{Arc, RwLock};

/// Tracks the proxy's slots and the number currently eligible to accept a
/// client. `usable` is written by `start` and `shutdown` only; the
/// acceptor and the workers read it.
pub struct SlotPool {
    slots: Vec<Arc<Slot>>,
    usable: RwLock<usize>,
}

impl SlotPool {
    pub fn new(slots: Vec<Arc<Slot>>) -> SlotPool {
        SlotPool {
            slots,
            usable: RwLock::new(0),
        }
    }

    #[inline]
    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently eligible for new clients.
    #[inline]
    pub fn usable(&self) -> usize {
        *self.usable.read().expect("Pool lock poisoned")
    }

    pub fn set_usable(&self, count: usize) {
        *self.usable.write().expect("Pool lock poisoned") = count;
    }

    /// Linearly probe the usable range for a free slot and reserve it.
    /// The linear scan tolerates slots made unusable by a shrunk count.
    pub fn reserve(&self) -> Option<Arc<Slot>> {
        let usable = self.usable();

        for slot in self.slots.iter().take(usable) {
            if slot.reserve() {
                return Some(slot.clone());
            }
        }

        None
    }

    /// Report the current occupancy to the registration collaborator.
    /// Called after every transition that can change either value.
    pub fn update_registration(&self, registry: &dyn Registry) {
        let total = self.usable();
        let used = self.slots.iter().filter(|slot| slot.in_use()).count();

        registry.update(used, total);
    }
}
