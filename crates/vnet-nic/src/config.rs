//! Attach-time parameters of the virtio-net function and the PCI identity it presents.

use vnet_pci::PciBdf;
use vnet_virtio::legacy::VIRTIO_NET_LEGACY_REGS_LEN;

use crate::error::ConfigError;

pub const VIRTIO_NET_VENDOR_ID: u16 = 0x1af4;
/// First transitional virtio device id; 0x1000 is the network device.
pub const VIRTIO_NET_DEVICE_ID: u16 = 0x1000;
pub const VIRTIO_NET_SUBSYSTEM_ID: u16 = 1;

pub const PCI_CLASS_NETWORK: u8 = 0x02;
pub const PCI_SUBCLASS_ETHERNET: u8 = 0x00;
pub const PCI_CACHE_LINE_SIZE: u8 = 64;
pub const PCI_LATENCY_TIMER: u8 = 64;

pub const DEFAULT_IOBASE: u16 = 0x9000;
pub const DEFAULT_BAR_SIZE_BITS: u8 = 6;
pub const DEFAULT_IRQ_LINE: u8 = 6;
pub const DEFAULT_QUEUE_SIZE: u16 = 128;
pub const DEFAULT_MTU: u32 = 1500;
pub const DEFAULT_BDF: PciBdf = PciBdf::new(0, 2, 0);

/// I/O BARs decode at most 256 ports.
const MAX_IO_BAR_SIZE_BITS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioNetConfig {
    pub bdf: PciBdf,
    pub iobase: u16,
    pub bar_size_bits: u8,
    pub irq_line: u8,
    pub queue_size: u16,
    pub mtu: u32,
    /// Upper bound on outstanding DMA staging bytes; `None` is unbounded.
    pub dma_budget: Option<usize>,
}

impl Default for VirtioNetConfig {
    fn default() -> Self {
        Self {
            bdf: DEFAULT_BDF,
            iobase: DEFAULT_IOBASE,
            bar_size_bits: DEFAULT_BAR_SIZE_BITS,
            irq_line: DEFAULT_IRQ_LINE,
            queue_size: DEFAULT_QUEUE_SIZE,
            mtu: DEFAULT_MTU,
            dma_budget: None,
        }
    }
}

impl VirtioNetConfig {
    pub fn bar_size(&self) -> u32 {
        1u32 << self.bar_size_bits.min(31)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if !self.queue_size.is_power_of_two() {
            return Err(ConfigError::QueueSizeNotPowerOfTwo(self.queue_size));
        }
        if self.bar_size_bits > MAX_IO_BAR_SIZE_BITS {
            return Err(ConfigError::BarTooLarge {
                bits: self.bar_size_bits,
            });
        }

        let size = self.bar_size();
        let required = u32::from(VIRTIO_NET_LEGACY_REGS_LEN);
        if size < required {
            return Err(ConfigError::BarTooSmall { size, required });
        }
        if u32::from(self.iobase) + size > 0x1_0000 {
            return Err(ConfigError::BarWraps {
                iobase: self.iobase,
                size,
            });
        }
        if u32::from(self.iobase) % size != 0 {
            return Err(ConfigError::MisalignedBar {
                iobase: self.iobase,
                size,
            });
        }
        if self.mtu == 0 {
            return Err(ConfigError::ZeroMtu);
        }
        Ok(())
    }
}
