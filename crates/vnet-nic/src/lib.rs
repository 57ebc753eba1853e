//! Virtio network device bridging a guest onto a shared inter-guest VLAN.
//!
//! The device is a legacy virtio-pci function with one I/O BAR. Guest port I/O inside the BAR is
//! forwarded to the ring emulation; transmitted frames are routed onto the fabric by
//! [`router::VlanRouter`], and frames queued for the guest's node are moved into guest receive
//! buffers by [`rx::drain_rx`] whenever the host calls [`VirtioNetHandle::notify`].
#![forbid(unsafe_code)]

pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod link;
pub mod pci;
pub mod registry;
pub mod router;
pub mod rx;

pub use config::VirtioNetConfig;
pub use device::{
    attach_virtio_net, GuestPlatform, VirtioNetBackend, VirtioNetDevice, VirtioNetHandle,
};
pub use dma::HeapDma;
pub use error::{AttachError, ConfigError, RegistryError, TxError};
pub use link::{GuestLink, UnconfiguredLink};
pub use pci::{VirtioNetIoBar, VirtioNetPciFunction};
pub use registry::{DeviceRegistry, GuestId};
pub use router::{TxStats, VlanRouter};
pub use rx::{drain_rx, RxDrainCounts, RxStats};
