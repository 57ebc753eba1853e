//! DMA staging buffers handed between an allocator and the ring emulation.

/// Alignment the ring emulation requests for every staging buffer.
pub const DMA_ALIGN: usize = core::mem::size_of::<usize>();

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("uncached DMA memory is not supported")]
    UncachedUnsupported,

    #[error("DMA alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("DMA budget exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaCacheOp {
    Clean,
    Invalidate,
    CleanInvalidate,
}

/// An aligned, zero-initialised block of host memory.
///
/// The region owns its storage; returning it through [`DmaManager::free`] consumes it, so a
/// region cannot be released twice.
#[derive(Debug)]
pub struct DmaRegion {
    storage: Box<[u8]>,
    offset: usize,
    len: usize,
    align: usize,
}

impl DmaRegion {
    /// Allocates `len` zeroed bytes whose first byte sits on an `align` boundary.
    pub fn zeroed(len: usize, align: usize) -> Result<Self, DmaError> {
        if !align.is_power_of_two() {
            return Err(DmaError::InvalidAlignment(align));
        }
        let storage = vec![0u8; len + align - 1].into_boxed_slice();
        let addr = storage.as_ptr() as usize;
        let offset = addr.wrapping_neg() & (align - 1);
        Ok(Self {
            storage,
            offset,
            len,
            align,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Host address of the first byte.
    pub fn host_addr(&self) -> u64 {
        self.as_slice().as_ptr() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

/// Allocator for DMA staging memory.
///
/// Methods take `&self` so one manager can be shared (`Rc<dyn DmaManager>`) between the device
/// and its ring emulation.
pub trait DmaManager {
    fn alloc(&self, size: usize, align: usize, cached: bool) -> Result<DmaRegion, DmaError>;

    fn free(&self, region: DmaRegion);

    /// Returns the device-visible address of `region`.
    fn pin(&self, region: &DmaRegion) -> u64;

    fn unpin(&self, region: &DmaRegion);

    fn cache_op(&self, region: &DmaRegion, op: DmaCacheOp);
}
