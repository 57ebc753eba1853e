//! PCI core types for the emulated devices: configuration space records, the per-guest bus keyed
//! by BDF, and the legacy configuration mechanism #1 ports.
#![forbid(unsafe_code)]

pub mod bus;
pub mod config;
pub mod ports;

pub use bus::{PciBus, PciError};
pub use config::{
    PciConfigSpace, PciDevice, PciIoBar, PciSubsystemIds, PciVendorDeviceId, PCI_CONFIG_SPACE_SIZE,
};
pub use ports::{register_pci_config_ports, PciConfigPorts, PCI_CFG_ADDR_PORT, PCI_CFG_DATA_PORT};

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    /// Creates a new BDF.
    ///
    /// The caller is responsible for ensuring device < 32 and function < 8.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Packs this BDF using the config-address bit layout (`(cfg_addr >> 8) & 0xFFFF`).
    pub const fn pack_u16(self) -> u16 {
        debug_assert!(self.device < 32);
        debug_assert!(self.function < 8);
        ((self.bus as u16) << 8) | ((self.device as u16) << 3) | (self.function as u16)
    }
}

impl core::fmt::Display for PciBdf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// PCI INTx interrupt pin, valued as the config-space pin register encodes it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum PciInterruptPin {
    IntA = 1,
    IntB = 2,
    IntC = 3,
    IntD = 4,
}
