//! Receive-side handle a guest NIC holds on its VLAN node.

use crate::fabric::NodeId;
use crate::mac::MacAddr;
use crate::vlan::Vlan;

/// Result of [`VlanEndpoint::poll_receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPoll {
    /// Nothing queued.
    None,
    /// A frame of this length was received and more are queued behind it.
    More(usize),
    /// A frame of this length was received and it was the last one queued.
    Last(usize),
}

/// One guest's receive side of a VLAN node.
///
/// A successful poll moves the oldest queued frame into the endpoint, where [`Self::rx_frame`]
/// exposes it until the next poll. Dropping the endpoint disconnects its node, leaving a hole
/// in the VLAN until [`Vlan::compact`].
pub struct VlanEndpoint {
    vlan: Vlan,
    node: NodeId,
    mac: MacAddr,
    current: Vec<u8>,
}

impl VlanEndpoint {
    pub(crate) fn new(vlan: Vlan, node: NodeId, mac: MacAddr) -> Self {
        Self {
            vlan,
            node,
            mac,
            current: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn vlan(&self) -> &Vlan {
        &self.vlan
    }

    pub fn poll_receive(&mut self) -> RxPoll {
        let popped = self.vlan.lock().pop_frame(self.node);
        match popped {
            None => RxPoll::None,
            Some((frame, remaining)) => {
                let len = frame.len();
                self.current = frame;
                if remaining > 0 {
                    RxPoll::More(len)
                } else {
                    RxPoll::Last(len)
                }
            }
        }
    }

    /// The frame returned by the most recent successful poll.
    pub fn rx_frame(&self) -> &[u8] {
        &self.current
    }
}

impl Drop for VlanEndpoint {
    fn drop(&mut self) {
        // Already gone if someone called `Vlan::disconnect` for us.
        let _ = self.vlan.disconnect(self.node);
    }
}

impl core::fmt::Debug for VlanEndpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VlanEndpoint")
            .field("node", &self.node)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}
