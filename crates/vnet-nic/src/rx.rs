//! Receive bridge: moves frames queued on the guest link into guest receive buffers.

use vnet_virtio::{RingEmulation, RxCompletion};
use vnet_vlan::RxPoll;

use crate::link::GuestLink;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxStats {
    pub frames: u64,
    pub dropped_no_buffer: u64,
    pub drains: u64,
}

/// Frames moved by one [`drain_rx`] call.
#[must_use]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxDrainCounts {
    pub delivered: usize,
    pub dropped: usize,
}

impl RxDrainCounts {
    pub fn total(&self) -> usize {
        self.delivered + self.dropped
    }
}

/// Drains every frame queued on `link` into the guest.
///
/// Each frame gets its own receive buffer and completion. A frame the guest has no buffer for is
/// dropped and draining continues; the loop ends once the link reports its last frame or nothing
/// at all.
pub fn drain_rx(
    emul: &mut dyn RingEmulation,
    link: &mut dyn GuestLink,
    stats: &mut RxStats,
) -> RxDrainCounts {
    let mut counts = RxDrainCounts::default();
    stats.drains += 1;

    loop {
        let (len, last) = match link.poll_receive() {
            RxPoll::None => break,
            RxPoll::More(len) => (len, false),
            RxPoll::Last(len) => (len, true),
        };

        match emul.allocate_rx_buf(len) {
            Some(mut buf) => {
                let frame = link.rx_frame();
                let n = len.min(frame.len()).min(buf.len());
                buf.as_mut_slice()[..n].copy_from_slice(&frame[..n]);
                emul.rx_complete(vec![RxCompletion { buf, len: n }]);
                counts.delivered += 1;
                stats.frames += 1;
            }
            None => {
                tracing::warn!(len, "no guest receive buffer, dropping frame");
                counts.dropped += 1;
                stats.dropped_no_buffer += 1;
            }
        }

        if last {
            break;
        }
    }

    if counts.total() > 0 {
        tracing::trace!(delivered = counts.delivered, dropped = counts.dropped, "receive drain");
    }
    counts
}
