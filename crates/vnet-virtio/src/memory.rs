use std::cell::RefCell;
use std::rc::Rc;

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum GuestMemoryError {
    #[error("guest memory access out of range: addr={addr:#x} len={len} size={size:#x}")]
    OutOfRange { addr: u64, len: usize, size: u64 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Guest physical memory as seen by the device: plain byte reads and writes at guest addresses.
pub trait GuestMemory {
    fn size(&self) -> u64;

    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    fn write_from(&mut self, addr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    fn read_u16_le(&self, addr: u64) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&self, addr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&self, addr: u64) -> GuestMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u16_le(&mut self, addr: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(addr, &value.to_le_bytes())
    }

    fn write_u32_le(&mut self, addr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(addr, &value.to_le_bytes())
    }

    fn write_u64_le(&mut self, addr: u64, value: u64) -> GuestMemoryResult<()> {
        self.write_from(addr, &value.to_le_bytes())
    }
}

/// Contiguous guest RAM starting at physical address 0.
#[derive(Debug, Clone)]
pub struct GuestRam {
    bytes: Vec<u8>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    fn range(&self, addr: u64, len: usize) -> GuestMemoryResult<core::ops::Range<usize>> {
        let size = self.bytes.len() as u64;
        let err = GuestMemoryError::OutOfRange { addr, len, size };
        let end = addr.checked_add(len as u64).ok_or(err)?;
        if end > size {
            return Err(err);
        }
        Ok(addr as usize..end as usize)
    }
}

impl GuestMemory for GuestRam {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let range = self.range(addr, dst.len())?;
        dst.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let range = self.range(addr, src.len())?;
        self.bytes[range].copy_from_slice(src);
        Ok(())
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for Box<T> {
    fn size(&self) -> u64 {
        <T as GuestMemory>::size(self)
    }

    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        <T as GuestMemory>::read_into(self, addr, dst)
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        <T as GuestMemory>::write_from(self, addr, src)
    }
}

/// Shared guest memory: the device and the host side of a test harness (or another device) see
/// the same bytes.
impl<T: GuestMemory + ?Sized> GuestMemory for Rc<RefCell<T>> {
    fn size(&self) -> u64 {
        self.borrow().size()
    }

    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        self.borrow().read_into(addr, dst)
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        self.borrow_mut().write_from(addr, src)
    }
}
