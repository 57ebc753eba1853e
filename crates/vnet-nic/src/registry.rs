//! Host-side lookup of virtio-net devices by guest.
//!
//! Fabric rx-ready callbacks may run on any thread and while a guest's device is in the middle of
//! a port access (a guest broadcasting to itself signals its own node). They therefore only mark
//! the guest as pending; [`DeviceRegistry::dispatch_pending`] runs the receive bridges afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::device::VirtioNetHandle;
use crate::error::RegistryError;
use crate::rx::RxDrainCounts;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestId(pub u32);

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guest{}", self.0)
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<GuestId, VirtioNetHandle>,
    pending: Arc<Mutex<BTreeSet<GuestId>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, guest: GuestId, device: VirtioNetHandle) -> Result<(), RegistryError> {
        if self.devices.contains_key(&guest) {
            return Err(RegistryError::DuplicateGuest(guest));
        }
        self.devices.insert(guest, device);
        Ok(())
    }

    pub fn get(&self, guest: GuestId) -> Option<&VirtioNetHandle> {
        self.devices.get(&guest)
    }

    pub fn remove(&mut self, guest: GuestId) -> Option<VirtioNetHandle> {
        self.lock_pending().remove(&guest);
        self.devices.remove(&guest)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Runs `guest`'s receive bridge now.
    pub fn notify(&self, guest: GuestId) -> Result<RxDrainCounts, RegistryError> {
        let device = self
            .devices
            .get(&guest)
            .ok_or(RegistryError::UnknownGuest(guest))?;
        Ok(device.notify())
    }

    /// Callback to install as the fabric rx-ready notification for `guest`'s node.
    pub fn rx_ready_notifier(&self, guest: GuestId) -> impl Fn() + Send + Sync + 'static {
        let pending = Arc::clone(&self.pending);
        move || {
            pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(guest);
        }
    }

    /// Guests signalled since the last dispatch.
    pub fn pending(&self) -> Vec<GuestId> {
        self.lock_pending().iter().copied().collect()
    }

    /// Drains every guest signalled since the last dispatch, in guest order.
    pub fn dispatch_pending(&self) -> Vec<(GuestId, RxDrainCounts)> {
        let pending = std::mem::take(&mut *self.lock_pending());
        let mut drained = Vec::with_capacity(pending.len());
        for guest in pending {
            match self.notify(guest) {
                Ok(counts) => drained.push((guest, counts)),
                Err(err) => tracing::warn!(%err, "rx-ready signal for a guest without a device"),
            }
        }
        drained
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, BTreeSet<GuestId>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
