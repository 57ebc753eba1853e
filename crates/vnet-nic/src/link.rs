//! The receive-side seam between a device and whatever feeds it frames.

use vnet_vlan::{MacAddr, RxPoll, VlanEndpoint};

/// Receive side of the guest's attachment to the fabric.
pub trait GuestLink {
    /// Address the guest is known by on the fabric.
    fn mac(&self) -> MacAddr;

    /// Moves the next queued frame into the link, reporting its length and whether more follow.
    fn poll_receive(&mut self) -> RxPoll;

    /// The frame moved in by the last successful [`GuestLink::poll_receive`].
    fn rx_frame(&self) -> &[u8];
}

impl GuestLink for VlanEndpoint {
    fn mac(&self) -> MacAddr {
        VlanEndpoint::mac(self)
    }

    fn poll_receive(&mut self) -> RxPoll {
        VlanEndpoint::poll_receive(self)
    }

    fn rx_frame(&self) -> &[u8] {
        VlanEndpoint::rx_frame(self)
    }
}

impl<T: GuestLink + ?Sized> GuestLink for Box<T> {
    fn mac(&self) -> MacAddr {
        <T as GuestLink>::mac(&**self)
    }

    fn poll_receive(&mut self) -> RxPoll {
        <T as GuestLink>::poll_receive(&mut **self)
    }

    fn rx_frame(&self) -> &[u8] {
        <T as GuestLink>::rx_frame(&**self)
    }
}

/// Stand-in for a guest that was never connected to a fabric. Any use is a wiring bug.
#[derive(Debug, Default)]
pub struct UnconfiguredLink;

impl UnconfiguredLink {
    #[track_caller]
    fn unconfigured(op: &'static str) -> ! {
        tracing::error!(op, "guest link used before one was configured");
        panic!("guest link not configured ({op})");
    }
}

impl GuestLink for UnconfiguredLink {
    fn mac(&self) -> MacAddr {
        Self::unconfigured("mac")
    }

    fn poll_receive(&mut self) -> RxPoll {
        Self::unconfigured("poll_receive")
    }

    fn rx_frame(&self) -> &[u8] {
        Self::unconfigured("rx_frame")
    }
}
