//! Errors raised while attaching a device, routing its frames and tracking it in a registry.

use vnet_pci::{PciBdf, PciError};
use vnet_platform::IoPortError;
use vnet_vlan::{FabricError, MacAddr, NodeId};

use crate::registry::GuestId;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("virtqueue size must be non-zero")]
    ZeroQueueSize,

    #[error("virtqueue size {0} is not a power of two")]
    QueueSizeNotPowerOfTwo(u16),

    #[error("I/O BAR of {size} bytes cannot hold the {required}-byte register block")]
    BarTooSmall { size: u32, required: u32 },

    #[error("I/O BAR of 2^{bits} bytes exceeds the 256-byte limit for I/O BARs")]
    BarTooLarge { bits: u8 },

    #[error("I/O BAR at {iobase:#x} with {size} bytes wraps past port 0xFFFF")]
    BarWraps { iobase: u16, size: u32 },

    #[error("I/O BAR base {iobase:#x} is not aligned to its {size}-byte size")]
    MisalignedBar { iobase: u16, size: u32 },

    #[error("MTU must be non-zero")]
    ZeroMtu,
}

/// Why a frame (or one copy of it) did not reach its destination.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    #[error("frame of {len} bytes is too short to carry a destination MAC")]
    Runt { len: usize },

    #[error("destination {0} is not on the VLAN")]
    Unreachable(MacAddr),

    #[error("no buffer for {node}: {source}")]
    Allocate { node: NodeId, source: FabricError },

    #[error("writing to {node} failed: {source}")]
    Write { node: NodeId, source: FabricError },

    #[error("signalling {node} failed: {source}")]
    Signal { node: NodeId, source: FabricError },
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    #[error("invalid virtio-net configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("a virtio-net function is already attached at {0}")]
    AlreadyAttached(PciBdf),

    #[error("I/O BAR ports unavailable: {0}")]
    PortRangeInUse(#[from] IoPortError),

    #[error("PCI slot unavailable: {0}")]
    PciSlotInUse(#[from] PciError),
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no virtio-net device registered for {0}")]
    UnknownGuest(GuestId),

    #[error("{0} already has a virtio-net device")]
    DuplicateGuest(GuestId),
}
