//! x86 port I/O: device trait and the per-guest bus that decodes ports to devices.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

/// A device model reachable through x86 port I/O.
pub trait PortIoDevice {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);

    /// Back to the power-on state.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoPortError {
    #[error("I/O port range length must be non-zero")]
    EmptyRange,

    #[error("I/O port range wraps past 0xFFFF: start={start:#x} len={len:#x}")]
    Wrap { start: u16, len: u16 },

    #[error("I/O port range [{start:#x}..{end:#x}) overlaps [{other_start:#x}..{other_end:#x})")]
    Overlap {
        start: u32,
        end: u32,
        other_start: u32,
        other_end: u32,
    },
}

struct PortRange {
    end: u32,
    name: &'static str,
    dev: Box<dyn PortIoDevice>,
}

fn floating(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// Port-I/O dispatch for one guest.
///
/// Single-port handlers win over range handlers. Ranges are keyed by their first port and never
/// overlap, so at most one range decodes any port.
#[derive(Default)]
pub struct IoPortBus {
    ports: HashMap<u16, Box<dyn PortIoDevice>>,
    ranges: BTreeMap<u16, PortRange>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a handler for exactly one port, replacing any previous one.
    pub fn register(&mut self, port: u16, dev: Box<dyn PortIoDevice>) {
        self.ports.insert(port, dev);
    }

    pub fn unregister(&mut self, port: u16) -> Option<Box<dyn PortIoDevice>> {
        self.ports.remove(&port)
    }

    /// Registers one device over `[start, start + len)`.
    ///
    /// `name` only shows up in logs and [`Self::range_owner`].
    pub fn try_register_range(
        &mut self,
        start: u16,
        len: u16,
        name: &'static str,
        dev: Box<dyn PortIoDevice>,
    ) -> Result<(), IoPortError> {
        let end = self.check_range(start, len)?;
        tracing::debug!(start, len, name, "registered I/O port range");
        self.ranges.insert(start, PortRange { end, name, dev });
        Ok(())
    }

    /// `Ok(())` when `[start, start + len)` could be registered right now.
    pub fn is_range_free(&self, start: u16, len: u16) -> Result<(), IoPortError> {
        self.check_range(start, len).map(|_| ())
    }

    /// Removes the range registered at exactly `start`.
    pub fn unregister_range(&mut self, start: u16) -> Option<Box<dyn PortIoDevice>> {
        self.ranges.remove(&start).map(|range| range.dev)
    }

    /// Name of the range device decoding `port`, if any.
    pub fn range_owner(&self, port: u16) -> Option<&'static str> {
        self.range_at(port).map(|(_, range)| range.name)
    }

    /// Returns the exclusive end of the range on success.
    fn check_range(&self, start: u16, len: u16) -> Result<u32, IoPortError> {
        if len == 0 {
            return Err(IoPortError::EmptyRange);
        }
        let end = u32::from(start) + u32::from(len);
        if end > 0x1_0000 {
            return Err(IoPortError::Wrap { start, len });
        }

        // Only the closest range below and the first range above can collide.
        let below = self.ranges.range(..=start).next_back();
        let above = self.ranges.range(start..).next();
        for (&other_start, other) in below.into_iter().chain(above) {
            if u32::from(start) < other.end && u32::from(other_start) < end {
                return Err(IoPortError::Overlap {
                    start: u32::from(start),
                    end,
                    other_start: u32::from(other_start),
                    other_end: other.end,
                });
            }
        }
        Ok(end)
    }

    fn range_at(&self, port: u16) -> Option<(u16, &PortRange)> {
        let (&start, range) = self.ranges.range(..=port).next_back()?;
        (u32::from(port) < range.end).then_some((start, range))
    }

    fn range_at_mut(&mut self, port: u16) -> Option<&mut PortRange> {
        let (_, range) = self.ranges.range_mut(..=port).next_back()?;
        (u32::from(port) < range.end).then_some(range)
    }

    /// Guest `in`. Widths other than 1, 2 and 4 float high without reaching a device.
    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        if !matches!(size, 1 | 2 | 4) {
            return floating(4);
        }
        if let Some(dev) = self.ports.get_mut(&port) {
            return dev.read(port, size);
        }
        match self.range_at_mut(port) {
            Some(range) => range.dev.read(port, size),
            None => floating(size),
        }
    }

    /// Guest `out`. Writes to unclaimed ports vanish.
    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        if let Some(dev) = self.ports.get_mut(&port) {
            dev.write(port, size, value);
        } else if let Some(range) = self.range_at_mut(port) {
            range.dev.write(port, size, value);
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    /// Resets every registered device.
    pub fn reset(&mut self) {
        self.ports.values_mut().for_each(|dev| dev.reset());
        self.ranges.values_mut().for_each(|range| range.dev.reset());
    }
}
