use crate::dma::DmaRegion;
use crate::queue::DescriptorChain;
use crate::raw::RawInterface;

/// A receive buffer: a DMA staging region paired with the guest chain it will be copied into.
#[derive(Debug)]
pub struct RxBuffer {
    pub(crate) region: DmaRegion,
    pub(crate) chain: DescriptorChain,
}

impl RxBuffer {
    pub fn new(region: DmaRegion, chain: DescriptorChain) -> Self {
        Self { region, chain }
    }

    pub fn into_parts(self) -> (DmaRegion, DescriptorChain) {
        (self.region, self.chain)
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }

    pub fn head_index(&self) -> u16 {
        self.chain.head_index()
    }
}

/// A filled receive buffer handed back to the ring emulation.
#[derive(Debug)]
pub struct RxCompletion {
    pub buf: RxBuffer,
    pub len: usize,
}

/// The virtio ring emulation a device model forwards guest port I/O to.
pub trait RingEmulation {
    /// Reads `size` bytes at `offset` inside the device's I/O BAR.
    fn io_in(&mut self, offset: u16, size: u8) -> u32;

    fn io_out(&mut self, offset: u16, size: u8, value: u32);

    /// Obtains a staging buffer for a `len`-byte frame, or `None` when the guest has not posted a
    /// receive buffer that can take it.
    fn allocate_rx_buf(&mut self, len: usize) -> Option<RxBuffer>;

    /// Delivers filled receive buffers to the guest and signals it.
    fn rx_complete(&mut self, completions: Vec<RxCompletion>);

    fn raw(&self) -> &dyn RawInterface;
    fn raw_mut(&mut self) -> &mut dyn RawInterface;
}
