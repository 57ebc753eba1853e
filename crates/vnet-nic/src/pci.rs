//! PCI face of the device: the configuration record and the I/O BAR port handler.

use vnet_pci::{PciConfigSpace, PciDevice, PciInterruptPin, PciSubsystemIds};
use vnet_platform::PortIoDevice;

use crate::config::{
    VirtioNetConfig, PCI_CACHE_LINE_SIZE, PCI_CLASS_NETWORK, PCI_LATENCY_TIMER,
    PCI_SUBCLASS_ETHERNET, VIRTIO_NET_DEVICE_ID, VIRTIO_NET_SUBSYSTEM_ID, VIRTIO_NET_VENDOR_ID,
};
use crate::device::VirtioNetHandle;

const BAR0_OFFSET: u16 = 0x10;

/// Configuration space of the virtio-net function.
///
/// The record is fixed once built. Guest writes are dropped, apart from dword writes to BAR0 so
/// the size probe works; BAR0 itself never moves.
#[derive(Debug, Clone)]
pub struct VirtioNetPciFunction {
    config: PciConfigSpace,
}

impl VirtioNetPciFunction {
    pub fn new(net: &VirtioNetConfig) -> Self {
        let mut config = PciConfigSpace::new(VIRTIO_NET_VENDOR_ID, VIRTIO_NET_DEVICE_ID);
        config.set_class_code(PCI_CLASS_NETWORK, PCI_SUBCLASS_ETHERNET, 0, 0);
        config.set_subsystem_ids(PciSubsystemIds {
            subsystem_vendor_id: 0,
            subsystem_id: VIRTIO_NET_SUBSYSTEM_ID,
        });
        config.set_cache_line_size(PCI_CACHE_LINE_SIZE);
        config.set_latency_timer(PCI_LATENCY_TIMER);
        config.set_interrupt_line(net.irq_line);
        config.set_interrupt_pin(PciInterruptPin::IntA);
        config.set_fixed_io_bar(0, net.bar_size(), net.iobase);
        Self { config }
    }
}

impl PciDevice for VirtioNetPciFunction {
    fn config(&self) -> &PciConfigSpace {
        &self.config
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.config
    }

    fn config_write(&mut self, offset: u16, size: usize, value: u32) {
        if offset == BAR0_OFFSET && size == 4 {
            self.config.write(offset, size, value);
            return;
        }
        tracing::trace!(offset, size, value, "virtio-net config write ignored");
    }
}

/// Port handler registered over exactly the BAR range.
pub struct VirtioNetIoBar {
    dev: VirtioNetHandle,
}

impl VirtioNetIoBar {
    pub fn new(dev: VirtioNetHandle) -> Self {
        Self { dev }
    }
}

impl PortIoDevice for VirtioNetIoBar {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        self.dev.io_in(port, size)
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        self.dev.io_out(port, size, value);
    }

    fn reset(&mut self) {
        self.dev.reset();
    }
}
