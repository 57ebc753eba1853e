//! Functions attached to a guest's PCI bus, keyed by bus/device/function.

use crate::config::{PciConfigSpace, PciDevice};
use crate::PciBdf;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    #[error("PCI slot {0} is already occupied")]
    SlotInUse(PciBdf),
    #[error("PCI device {device} at {bdf} is out of range (device must be < 32, function < 8)")]
    InvalidBdf { bdf: PciBdf, device: u8 },
}

/// Per-guest PCI bus. Functions are stored in ascending BDF order so enumeration is
/// deterministic.
#[derive(Default)]
pub struct PciBus {
    devices: BTreeMap<PciBdf, Box<dyn PciDevice>>,
}

impl PciBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_slot_free(&self, bdf: PciBdf) -> bool {
        !self.devices.contains_key(&bdf)
    }

    pub fn add_device(&mut self, bdf: PciBdf, device: Box<dyn PciDevice>) -> Result<(), PciError> {
        if bdf.device >= 32 || bdf.function >= 8 {
            return Err(PciError::InvalidBdf {
                bdf,
                device: bdf.device,
            });
        }
        if !self.is_slot_free(bdf) {
            return Err(PciError::SlotInUse(bdf));
        }
        tracing::debug!(%bdf, "adding PCI function");
        self.devices.insert(bdf, device);
        Ok(())
    }

    pub fn remove_device(&mut self, bdf: PciBdf) -> Option<Box<dyn PciDevice>> {
        self.devices.remove(&bdf)
    }

    pub fn device_config(&self, bdf: PciBdf) -> Option<&PciConfigSpace> {
        self.devices.get(&bdf).map(|dev| dev.config())
    }

    pub fn iter_device_addrs(&self) -> impl Iterator<Item = PciBdf> + '_ {
        self.devices.keys().copied()
    }

    pub fn read_config(&mut self, bdf: PciBdf, offset: u16, size: u8) -> u32 {
        let Some(dev) = self.devices.get_mut(&bdf) else {
            // Absent functions read as all ones.
            return 0xFFFF_FFFF;
        };
        if !matches!(size, 1 | 2 | 4) || usize::from(offset) + usize::from(size) > 256 {
            return 0xFFFF_FFFF;
        }
        dev.config_read(offset, usize::from(size))
    }

    pub fn write_config(&mut self, bdf: PciBdf, offset: u16, size: u8, value: u32) {
        let Some(dev) = self.devices.get_mut(&bdf) else {
            return;
        };
        if !matches!(size, 1 | 2 | 4) || usize::from(offset) + usize::from(size) > 256 {
            return;
        }
        dev.config_write(offset, usize::from(size), value);
    }
}
