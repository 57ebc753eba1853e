//! Split virtqueue with the legacy (virtio 0.9) memory layout.

use crate::memory::{GuestMemory, GuestMemoryError};
use bitflags::bitflags;

pub const VIRTIO_PCI_LEGACY_VRING_ALIGN: u64 = 4096;

const DESC_SIZE: u64 = 16;
const USED_ELEM_SIZE: u64 = 8;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VirtqDescFlags: u16 {
        const NEXT = 1 << 0;
        const WRITE = 1 << 1;
        const INDIRECT = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VirtqAvailFlags: u16 {
        const NO_INTERRUPT = 1 << 0;
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum VirtQueueError {
    #[error("guest memory: {0}")]
    Memory(#[from] GuestMemoryError),

    #[error("descriptor index {index} out of range for chain headed at {head}")]
    InvalidDescriptorIndex { head: u16, index: u16 },

    #[error("descriptor chain headed at {head} loops or exceeds the queue size")]
    ChainTooLong { head: u16 },

    #[error("indirect descriptor in chain headed at {head} (not negotiated)")]
    IndirectUnsupported { head: u16 },
}

impl VirtQueueError {
    /// Head index of the offending chain, when one was already consumed from the avail ring.
    pub fn head(&self) -> Option<u16> {
        match self {
            Self::Memory(_) => None,
            Self::InvalidDescriptorIndex { head, .. }
            | Self::ChainTooLong { head }
            | Self::IndirectUnsupported { head } => Some(*head),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: VirtqDescFlags,
    pub next: u16,
}

impl Descriptor {
    pub fn is_write_only(&self) -> bool {
        self.flags.contains(VirtqDescFlags::WRITE)
    }

    fn has_next(&self) -> bool {
        self.flags.contains(VirtqDescFlags::NEXT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    head_index: u16,
    descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    pub fn new(head_index: u16, descriptors: Vec<Descriptor>) -> Self {
        Self {
            head_index,
            descriptors,
        }
    }

    pub fn head_index(&self) -> u16 {
        self.head_index
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Total bytes of device-writable buffers, or `None` if any buffer is device-readable.
    pub fn writable_len(&self) -> Option<u64> {
        if self.descriptors.iter().any(|d| !d.is_write_only()) {
            return None;
        }
        Some(self.descriptors.iter().map(|d| u64::from(d.len)).sum())
    }
}

/// Ring addresses for a legacy queue at page frame `pfn`.
///
/// Descriptor table, then the avail ring directly after it, then the used ring aligned up to
/// [`VIRTIO_PCI_LEGACY_VRING_ALIGN`].
pub fn legacy_vring_addresses(pfn: u32, queue_size: u16) -> (u64, u64, u64) {
    let desc = u64::from(pfn) << 12;
    let avail = desc + DESC_SIZE * u64::from(queue_size);
    let used_unaligned = avail + 4 + 2 * u64::from(queue_size) + 2;
    let used = align_up(used_unaligned, VIRTIO_PCI_LEGACY_VRING_ALIGN);
    (desc, avail, used)
}

fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone)]
pub struct VirtQueue {
    size: u16,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,
    next_avail: u16,
    next_used: u16,
}

impl VirtQueue {
    pub fn new(size: u16, desc_addr: u64, avail_addr: u64, used_addr: u64) -> Self {
        assert!(size.is_power_of_two(), "virtqueue size must be a power of two");
        Self {
            size,
            desc_addr,
            avail_addr,
            used_addr,
            next_avail: 0,
            next_used: 0,
        }
    }

    pub fn new_legacy(size: u16, pfn: u32) -> Self {
        let (desc, avail, used) = legacy_vring_addresses(pfn, size);
        Self::new(size, desc, avail, used)
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn used_addr(&self) -> u64 {
        self.used_addr
    }

    /// Pops the next available chain, or `Ok(None)` if the guest has not published one.
    ///
    /// A malformed chain is still consumed from the avail ring; the error carries its head so the
    /// caller can complete it with a zero length.
    pub fn pop_descriptor_chain(
        &mut self,
        mem: &dyn GuestMemory,
    ) -> Result<Option<DescriptorChain>, VirtQueueError> {
        let avail_idx = mem.read_u16_le(self.avail_addr + 2)?;
        if avail_idx == self.next_avail {
            return Ok(None);
        }

        let slot = u64::from(self.next_avail % self.size);
        let head = mem.read_u16_le(self.avail_addr + 4 + 2 * slot)?;
        self.next_avail = self.next_avail.wrapping_add(1);

        let mut descriptors = Vec::new();
        let mut index = head;
        loop {
            if index >= self.size {
                return Err(VirtQueueError::InvalidDescriptorIndex { head, index });
            }
            if descriptors.len() >= usize::from(self.size) {
                return Err(VirtQueueError::ChainTooLong { head });
            }
            let desc = self.read_descriptor(mem, index)?;
            if desc.flags.contains(VirtqDescFlags::INDIRECT) {
                return Err(VirtQueueError::IndirectUnsupported { head });
            }
            descriptors.push(desc);
            if !desc.has_next() {
                break;
            }
            index = desc.next;
        }

        Ok(Some(DescriptorChain {
            head_index: head,
            descriptors,
        }))
    }

    /// Publishes a used element for `head` and returns whether the guest wants an interrupt.
    pub fn add_used(
        &mut self,
        mem: &mut dyn GuestMemory,
        head: u16,
        len: u32,
    ) -> Result<bool, VirtQueueError> {
        let slot = u64::from(self.next_used % self.size);
        let elem = self.used_addr + 4 + USED_ELEM_SIZE * slot;
        mem.write_u32_le(elem, u32::from(head))?;
        mem.write_u32_le(elem + 4, len)?;
        self.next_used = self.next_used.wrapping_add(1);
        mem.write_u16_le(self.used_addr + 2, self.next_used)?;

        let flags = VirtqAvailFlags::from_bits_truncate(mem.read_u16_le(self.avail_addr)?);
        Ok(!flags.contains(VirtqAvailFlags::NO_INTERRUPT))
    }

    fn read_descriptor(&self, mem: &dyn GuestMemory, index: u16) -> Result<Descriptor, VirtQueueError> {
        let base = self.desc_addr + DESC_SIZE * u64::from(index);
        Ok(Descriptor {
            addr: mem.read_u64_le(base)?,
            len: mem.read_u32_le(base + 8)?,
            flags: VirtqDescFlags::from_bits_truncate(mem.read_u16_le(base + 12)?),
            next: mem.read_u16_le(base + 14)?,
        })
    }
}
