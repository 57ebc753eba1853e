//! The shared inter-guest link: a fabric of nodes addressed by MAC, each with a bounded frame
//! queue, plus the in-memory VLAN implementation and its per-node receive endpoint.
#![forbid(unsafe_code)]

pub mod endpoint;
pub mod fabric;
pub mod mac;
pub mod vlan;

pub use endpoint::{RxPoll, VlanEndpoint};
pub use fabric::{Fabric, FabricBuffer, FabricError, NodeId};
pub use mac::MacAddr;
pub use vlan::{NodeStats, Vlan, VlanConfig, DEFAULT_MAX_FRAME_LEN, DEFAULT_QUEUE_DEPTH};
