//! Virtio network device for guests sharing an in-host VLAN.
//!
//! The device model lives in [`nic`]; the remaining crates supply the guest platform it plugs
//! into ([`platform`], [`pci`]), the ring emulation ([`virtio`]) and the fabric ([`vlan`]).
#![forbid(unsafe_code)]

pub use vnet_nic as nic;
pub use vnet_pci as pci;
pub use vnet_platform as platform;
pub use vnet_virtio as virtio;
pub use vnet_vlan as vlan;

pub use vnet_nic::{
    attach_virtio_net, AttachError, DeviceRegistry, GuestId, GuestPlatform, VirtioNetBackend,
    VirtioNetConfig, VirtioNetHandle,
};
pub use vnet_vlan::{MacAddr, Vlan, VlanConfig};
