//! Configuration mechanism #1 on ports `0xCF8` and `0xCFC`.

use crate::bus::PciBus;
use crate::PciBdf;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use vnet_platform::io::{IoPortBus, IoPortError, PortIoDevice};

pub const PCI_CFG_ADDR_PORT: u16 = 0xCF8;
pub const PCI_CFG_DATA_PORT: u16 = 0xCFC;

/// PCI configuration mechanism #1 (`0xCF8` address latch, `0xCFC..=0xCFF` data window).
///
/// Clones share the address latch and the bus, so one instance can be registered for the
/// address port and another for the data window.
#[derive(Clone)]
pub struct PciConfigPorts {
    bus: Rc<RefCell<PciBus>>,
    addr: Rc<Cell<u32>>,
}

impl PciConfigPorts {
    /// Latch starts cleared, so data reads float until the guest writes an address.
    pub fn new(bus: Rc<RefCell<PciBus>>) -> Self {
        Self {
            bus,
            addr: Rc::new(Cell::new(0)),
        }
    }

    pub fn bus(&self) -> &Rc<RefCell<PciBus>> {
        &self.bus
    }

    /// Decodes the latched address into a target function and register offset for a data access
    /// at `port`. Returns `None` when the enable bit is clear.
    fn target(&self, port: u16) -> Option<(PciBdf, u16)> {
        let addr = self.addr.get();
        if addr & 0x8000_0000 == 0 {
            return None;
        }
        let bus = ((addr >> 16) & 0xFF) as u8;
        let device = ((addr >> 11) & 0x1F) as u8;
        let function = ((addr >> 8) & 0x07) as u8;
        let reg = (addr & 0xFC) as u16;
        Some((
            PciBdf::new(bus, device, function),
            reg + (port - PCI_CFG_DATA_PORT),
        ))
    }
}

impl PortIoDevice for PciConfigPorts {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        match port {
            PCI_CFG_ADDR_PORT => match size {
                1 => self.addr.get() & 0xFF,
                2 => self.addr.get() & 0xFFFF,
                _ => self.addr.get(),
            },
            PCI_CFG_DATA_PORT..=0xCFF => match self.target(port) {
                Some((bdf, offset)) => self.bus.borrow_mut().read_config(bdf, offset, size),
                None => 0xFFFF_FFFF,
            },
            _ => 0xFFFF_FFFF,
        }
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        match port {
            PCI_CFG_ADDR_PORT => {
                let old = self.addr.get();
                let new = match size {
                    1 => (old & !0xFF) | (value & 0xFF),
                    2 => (old & !0xFFFF) | (value & 0xFFFF),
                    _ => value,
                };
                self.addr.set(new);
            }
            PCI_CFG_DATA_PORT..=0xCFF => {
                if let Some((bdf, offset)) = self.target(port) {
                    self.bus.borrow_mut().write_config(bdf, offset, size, value);
                }
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.addr.set(0);
    }
}

/// Registers the configuration mechanism #1 ports for `bus` on `io`.
pub fn register_pci_config_ports(
    io: &mut IoPortBus,
    bus: Rc<RefCell<PciBus>>,
) -> Result<PciConfigPorts, IoPortError> {
    let ports = PciConfigPorts::new(bus);
    io.try_register_range(PCI_CFG_ADDR_PORT, 4, "pci-cfg-addr", Box::new(ports.clone()))?;
    io.try_register_range(PCI_CFG_DATA_PORT, 4, "pci-cfg-data", Box::new(ports.clone()))?;
    Ok(ports)
}
