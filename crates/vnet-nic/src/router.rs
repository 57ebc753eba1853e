//! Transmit path: frames the guest hands to the raw interface are routed onto the fabric by
//! destination MAC.
//!
//! A broadcast frame is copied to every slot of the fabric, the sender's own node included. A
//! unicast frame goes to the node owning the destination address, or nowhere. Each copy takes a
//! buffer lease on the destination, is written into it and the destination is signalled once.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use vnet_platform::IrqController;
use vnet_virtio::{LinkInfo, RawInterface, TxStatus};
use vnet_vlan::{Fabric, MacAddr, NodeId};

use crate::error::TxError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    /// Frames delivered to every live destination.
    pub frames: u64,
    pub frames_failed: u64,
    pub copies_delivered: u64,
    pub dropped_runt: u64,
    pub dropped_unreachable: u64,
    /// Destinations that had no buffer for a copy.
    pub allocate_failures: u64,
    pub write_failures: u64,
    pub signal_failures: u64,
    /// Empty fabric slots skipped during broadcast.
    pub node_holes: u64,
    /// Broadcasts that reached some but not all destinations.
    pub partial_broadcasts: u64,
}

/// [`RawInterface`] that routes guest frames onto a [`Fabric`] and raises the guest's interrupt
/// line for the ring emulation.
pub struct VlanRouter {
    fabric: Arc<dyn Fabric>,
    mac: MacAddr,
    mtu: u32,
    irq: Rc<RefCell<dyn IrqController>>,
    stats: TxStats,
}

impl VlanRouter {
    /// A router sending as `mac` with `mtu` reported to the guest. `irq` is the line controller
    /// the ring emulation raises and lowers through [`RawInterface`].
    pub fn new(
        fabric: Arc<dyn Fabric>,
        mac: MacAddr,
        mtu: u32,
        irq: Rc<RefCell<dyn IrqController>>,
    ) -> Self {
        Self {
            fabric,
            mac,
            mtu,
            irq,
            stats: TxStats::default(),
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    /// Routes one frame. On success every live destination holds one copy and was signalled once.
    ///
    /// Failures are logged and counted before they are returned; for a broadcast the first
    /// failing destination is reported.
    pub fn route_frame(&mut self, frame: &[u8]) -> Result<(), TxError> {
        let result = self.route(frame);
        match result {
            Ok(()) => self.stats.frames += 1,
            Err(_) => self.stats.frames_failed += 1,
        }
        result
    }

    fn route(&mut self, frame: &[u8]) -> Result<(), TxError> {
        let Some(dest) = MacAddr::from_frame(frame) else {
            tracing::warn!(len = frame.len(), "frame too short for a destination address");
            self.stats.dropped_runt += 1;
            return Err(TxError::Runt { len: frame.len() });
        };

        if dest.is_broadcast() {
            return self.broadcast(frame);
        }

        match self.fabric.lookup_node(dest) {
            Some(node) => self.deliver(node, frame),
            None => {
                tracing::error!(dest = %dest, src = %self.mac, "destination not on the VLAN");
                self.stats.dropped_unreachable += 1;
                Err(TxError::Unreachable(dest))
            }
        }
    }

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), TxError> {
        let slots = self.fabric.connected_count();
        let mut delivered = 0usize;
        let mut first_err = None;

        for slot in 0..slots {
            let Some(node) = self.fabric.nth_connected(slot) else {
                tracing::warn!(slot, "no node in VLAN slot, skipping");
                self.stats.node_holes += 1;
                continue;
            };
            match self.deliver(node, frame) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            None => Ok(()),
            Some(err) => {
                if delivered > 0 {
                    tracing::warn!(delivered, slots, "broadcast reached only part of the VLAN");
                    self.stats.partial_broadcasts += 1;
                }
                Err(err)
            }
        }
    }

    /// Copies `frame` to `node`: lease a buffer, fill it, signal.
    fn deliver(&mut self, node: NodeId, frame: &[u8]) -> Result<(), TxError> {
        let buffer = match self.fabric.allocate_buffer(node, frame.len()) {
            Ok(buffer) => buffer,
            Err(source) => {
                tracing::warn!(%node, len = frame.len(), %source, "no fabric buffer, dropping copy");
                self.stats.allocate_failures += 1;
                return Err(TxError::Allocate { node, source });
            }
        };

        // A failed write drops the lease, which hands the reservation back.
        if let Err(source) = self.fabric.write(buffer, frame) {
            tracing::error!(%node, len = frame.len(), %source, "fabric write failed");
            self.stats.write_failures += 1;
            return Err(TxError::Write { node, source });
        }

        if let Err(source) = self.fabric.signal(node) {
            tracing::error!(%node, %source, "signalling destination failed");
            self.stats.signal_failures += 1;
            return Err(TxError::Signal { node, source });
        }

        self.stats.copies_delivered += 1;
        Ok(())
    }
}

impl RawInterface for VlanRouter {
    fn raw_tx(&mut self, frames: &[&[u8]]) -> TxStatus {
        let mut status = TxStatus::Complete;
        for frame in frames {
            if self.route_frame(frame).is_err() {
                status = TxStatus::Failed;
            }
        }
        status
    }

    fn handle_irq(&mut self, irq: u8) {
        self.irq.borrow_mut().raise_irq(irq);
    }

    fn ack_irq(&mut self, irq: u8) {
        self.irq.borrow_mut().lower_irq(irq);
    }

    fn low_level_init(&mut self) -> LinkInfo {
        LinkInfo {
            mac: self.mac.octets(),
            mtu: self.mtu,
        }
    }

    fn print_state(&self) {
        let s = &self.stats;
        tracing::info!(
            mac = %self.mac,
            mtu = self.mtu,
            frames = s.frames,
            frames_failed = s.frames_failed,
            copies = s.copies_delivered,
            runts = s.dropped_runt,
            unreachable = s.dropped_unreachable,
            no_buffer = s.allocate_failures,
            write_failures = s.write_failures,
            signal_failures = s.signal_failures,
            holes = s.node_holes,
            partial_broadcasts = s.partial_broadcasts,
            "virtio-net transmit state"
        );
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
