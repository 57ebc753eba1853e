//! Type 0 configuration space for one PCI function, with fixed and relocatable I/O BARs.

use crate::PciInterruptPin;

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;

const BAR0: usize = 0x10;
const BAR_SLOTS: usize = 6;
const BAR_IO_SPACE: u32 = 0x1;
const BAR_IO_ADDR_MASK: u32 = 0xFFFF_FFFC;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciVendorDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciSubsystemIds {
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
}

/// An I/O space BAR as the guest sees it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciIoBar {
    pub base: u16,
    pub size: u16,
}

impl PciIoBar {
    pub fn contains(&self, port: u16) -> bool {
        port.wrapping_sub(self.base) < self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct IoBarSlot {
    size: u32,
    base: u32,
    fixed: bool,
    sizing: bool,
}

impl IoBarSlot {
    fn register(&self) -> u32 {
        if self.sizing {
            !(self.size - 1) & BAR_IO_ADDR_MASK | BAR_IO_SPACE
        } else {
            self.base | BAR_IO_SPACE
        }
    }

    fn guest_write(&mut self, value: u32) {
        self.sizing = value == 0xFFFF_FFFF;
        if !self.sizing && !self.fixed {
            self.base = value & BAR_IO_ADDR_MASK & !(self.size - 1);
        }
    }
}

/// Configuration space of one Type 0 (endpoint) function whose BARs all decode I/O space.
///
/// Byte, word and dword accesses are supported. BARs answer the usual sizing sequence (write
/// all ones, read back the size mask); fixed BARs keep their base through any other write.
#[derive(Debug, Clone)]
pub struct PciConfigSpace {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    bars: [Option<IoBarSlot>; BAR_SLOTS],
}

impl PciConfigSpace {
    pub const COMMAND_OFFSET: u16 = 0x04;
    pub const CACHE_LINE_SIZE_OFFSET: u16 = 0x0C;
    pub const LATENCY_TIMER_OFFSET: u16 = 0x0D;
    pub const INTERRUPT_LINE_OFFSET: u16 = 0x3C;
    pub const INTERRUPT_PIN_OFFSET: u16 = 0x3D;

    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut bytes = [0u8; PCI_CONFIG_SPACE_SIZE];
        bytes[..2].copy_from_slice(&vendor_id.to_le_bytes());
        bytes[2..4].copy_from_slice(&device_id.to_le_bytes());
        Self {
            bytes,
            bars: [None; BAR_SLOTS],
        }
    }

    fn word(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn set_word(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn vendor_device_id(&self) -> PciVendorDeviceId {
        PciVendorDeviceId {
            vendor_id: self.word(0x00),
            device_id: self.word(0x02),
        }
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8, revision_id: u8) {
        self.bytes[0x08..0x0c].copy_from_slice(&[revision_id, prog_if, subclass, class]);
    }

    pub fn set_subsystem_ids(&mut self, ids: PciSubsystemIds) {
        self.set_word(0x2c, ids.subsystem_vendor_id);
        self.set_word(0x2e, ids.subsystem_id);
    }

    pub fn subsystem_ids(&self) -> PciSubsystemIds {
        PciSubsystemIds {
            subsystem_vendor_id: self.word(0x2c),
            subsystem_id: self.word(0x2e),
        }
    }

    pub fn set_cache_line_size(&mut self, size: u8) {
        self.bytes[usize::from(Self::CACHE_LINE_SIZE_OFFSET)] = size;
    }

    pub fn set_latency_timer(&mut self, timer: u8) {
        self.bytes[usize::from(Self::LATENCY_TIMER_OFFSET)] = timer;
    }

    pub fn command(&self) -> u16 {
        self.word(usize::from(Self::COMMAND_OFFSET))
    }

    pub fn interrupt_line(&self) -> u8 {
        self.bytes[usize::from(Self::INTERRUPT_LINE_OFFSET)]
    }

    pub fn set_interrupt_line(&mut self, line: u8) {
        self.bytes[usize::from(Self::INTERRUPT_LINE_OFFSET)] = line;
    }

    /// Raw pin register: 0 for none, 1..=4 for INTA#..INTD#.
    pub fn interrupt_pin(&self) -> u8 {
        self.bytes[usize::from(Self::INTERRUPT_PIN_OFFSET)]
    }

    pub fn set_interrupt_pin(&mut self, pin: PciInterruptPin) {
        self.bytes[usize::from(Self::INTERRUPT_PIN_OFFSET)] = pin as u8;
    }

    /// Defines BAR `index` as an I/O BAR of `size` ports that the guest may relocate.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a BAR slot or `size` is not a power of two of at least 4.
    pub fn set_io_bar(&mut self, index: u8, size: u32) {
        self.define_bar(index, size, 0, false);
    }

    /// Like [`Self::set_io_bar`], but pinned at `base`.
    pub fn set_fixed_io_bar(&mut self, index: u8, size: u32, base: u16) {
        self.define_bar(index, size, u32::from(base), true);
    }

    fn define_bar(&mut self, index: u8, size: u32, base: u32, fixed: bool) {
        let index = usize::from(index);
        assert!(index < BAR_SLOTS, "BAR index {index} out of range");
        assert!(
            size.is_power_of_two() && size >= 4,
            "I/O BAR size must be a power of two of at least 4"
        );
        self.bars[index] = Some(IoBarSlot {
            size,
            base: base & BAR_IO_ADDR_MASK,
            fixed,
            sizing: false,
        });
    }

    /// Current decode window of BAR `index`.
    pub fn io_bar(&self, index: u8) -> Option<PciIoBar> {
        let slot = self.bars.get(usize::from(index))?.as_ref()?;
        Some(PciIoBar {
            base: slot.base as u16,
            size: slot.size as u16,
        })
    }

    fn bar_slot(offset: usize) -> Option<usize> {
        (BAR0..BAR0 + BAR_SLOTS * 4)
            .contains(&offset)
            .then(|| (offset - BAR0) / 4)
    }

    fn dword(&self, aligned: usize) -> u32 {
        match Self::bar_slot(aligned) {
            Some(slot) => self.bars[slot].map_or(0, |bar| bar.register()),
            None => u32::from_le_bytes([
                self.bytes[aligned],
                self.bytes[aligned + 1],
                self.bytes[aligned + 2],
                self.bytes[aligned + 3],
            ]),
        }
    }

    /// # Panics
    ///
    /// Panics on widths other than 1, 2 or 4, or on an access past the end of the space.
    pub fn read(&self, offset: u16, size: usize) -> u32 {
        let offset = usize::from(offset);
        assert!(matches!(size, 1 | 2 | 4) && offset + size <= PCI_CONFIG_SPACE_SIZE);

        let aligned = offset & !0x3;
        let mut value = self.dword(aligned) >> ((offset - aligned) * 8);
        // Accesses straddling a dword boundary pick up the next register.
        if offset + size > aligned + 4 {
            value |= self.dword(aligned + 4) << ((aligned + 4 - offset) * 8);
        }
        match size {
            1 => value & 0xFF,
            2 => value & 0xFFFF,
            _ => value,
        }
    }

    /// # Panics
    ///
    /// Same conditions as [`Self::read`].
    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        let offset = usize::from(offset);
        assert!(matches!(size, 1 | 2 | 4) && offset + size <= PCI_CONFIG_SPACE_SIZE);

        if let Some(slot) = Self::bar_slot(offset) {
            // BARs only take aligned dword writes.
            if size == 4 && offset & 0x3 == 0 {
                if let Some(bar) = self.bars[slot].as_mut() {
                    bar.guest_write(value);
                }
            }
            return;
        }

        for (i, byte) in value.to_le_bytes().into_iter().take(size).enumerate() {
            let addr = offset + i;
            if !Self::is_read_only_byte(addr) {
                self.bytes[addr] = byte;
            }
        }
    }

    fn is_read_only_byte(addr: usize) -> bool {
        // IDs, status, revision/class, header type, subsystem IDs and interrupt pin.
        matches!(addr, 0x00..=0x03 | 0x06..=0x0b | 0x0e | 0x2c..=0x2f | 0x3d)
    }
}

/// A PCI function reachable through a [`crate::PciBus`].
///
/// The default accessors forward to the plain [`PciConfigSpace`] behavior. Functions with a
/// stricter policy override [`PciDevice::config_write`].
pub trait PciDevice {
    fn config(&self) -> &PciConfigSpace;
    fn config_mut(&mut self) -> &mut PciConfigSpace;

    fn config_read(&mut self, offset: u16, size: usize) -> u32 {
        self.config().read(offset, size)
    }

    fn config_write(&mut self, offset: u16, size: usize, value: u32) {
        self.config_mut().write(offset, size, value);
    }
}
