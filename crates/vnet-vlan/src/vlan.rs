//! The in-process VLAN: a shared set of node queues that implements [`Fabric`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::endpoint::VlanEndpoint;
use crate::fabric::{Fabric, FabricBuffer, FabricError, NodeId};
use crate::mac::MacAddr;

/// Default per-node queue depth in frames.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Largest Ethernet frame carried by default: 1500-byte MTU plus the 14-byte header.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1514;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanConfig {
    /// Frames a node can hold, counting both reserved and queued frames.
    pub queue_depth: usize,
    pub max_frame_len: usize,
}

impl Default for VlanConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub frames_enqueued: u64,
    pub frames_delivered: u64,
    pub signals: u64,
    pub rejected_full: u64,
}

type RxReady = Arc<dyn Fn() + Send + Sync>;

struct Node {
    id: NodeId,
    mac: MacAddr,
    queue: VecDeque<Vec<u8>>,
    reserved: usize,
    rx_ready: Option<RxReady>,
    stats: NodeStats,
}

#[derive(Default)]
pub(crate) struct VlanState {
    slots: Vec<Option<Node>>,
    next_id: u32,
}

impl VlanState {
    fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots.iter().flatten().find(|n| n.id == id)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.iter_mut().flatten().find(|n| n.id == id)
    }

    /// Pops the oldest frame for `id` and reports how many remain.
    pub(crate) fn pop_frame(&mut self, id: NodeId) -> Option<(Vec<u8>, usize)> {
        let node = self.node_mut(id)?;
        let frame = node.queue.pop_front()?;
        node.stats.frames_delivered += 1;
        Some((frame, node.queue.len()))
    }
}

/// An in-memory VLAN shared by the guests of one host.
///
/// Cloning yields another handle to the same VLAN. All state sits behind one mutex; rx-ready
/// callbacks run after it is released.
#[derive(Clone)]
pub struct Vlan {
    state: Arc<Mutex<VlanState>>,
    config: VlanConfig,
}

impl Default for Vlan {
    fn default() -> Self {
        Self::new(VlanConfig::default())
    }
}

impl Vlan {
    pub fn new(config: VlanConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(VlanState::default())),
            config,
        }
    }

    pub fn config(&self) -> VlanConfig {
        self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VlanState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a node for `mac` in the next slot and returns its receive endpoint.
    pub fn connect(&self, mac: MacAddr) -> Result<VlanEndpoint, FabricError> {
        let mut state = self.lock();
        if state.slots.iter().flatten().any(|n| n.mac == mac) {
            return Err(FabricError::DuplicateMac(mac));
        }
        let id = NodeId(state.next_id);
        state.next_id += 1;
        state.slots.push(Some(Node {
            id,
            mac,
            queue: VecDeque::new(),
            reserved: 0,
            rx_ready: None,
            stats: NodeStats::default(),
        }));
        drop(state);

        tracing::debug!(%id, %mac, "node connected");
        Ok(VlanEndpoint::new(self.clone(), id, mac))
    }

    /// Removes `node`. Its slot stays behind as a hole until [`Self::compact`].
    pub fn disconnect(&self, node: NodeId) -> Result<(), FabricError> {
        let mut state = self.lock();
        let slot = state
            .slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|n| n.id == node))
            .ok_or(FabricError::UnknownNode(node))?;
        // The node's callback may own handles into this VLAN; drop it unlocked.
        let departed = slot.take();
        drop(state);
        drop(departed);
        tracing::debug!(%node, "node disconnected");
        Ok(())
    }

    /// Drops empty slots, renumbering the remaining nodes' slot positions.
    pub fn compact(&self) {
        self.lock().slots.retain(Option::is_some);
    }

    /// Installs the callback [`Fabric::signal`] fires for `node`.
    pub fn register_rx_ready(
        &self,
        node: NodeId,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), FabricError> {
        let mut state = self.lock();
        let n = state.node_mut(node).ok_or(FabricError::UnknownNode(node))?;
        n.rx_ready = Some(Arc::new(callback));
        Ok(())
    }

    pub fn node_stats(&self, node: NodeId) -> Option<NodeStats> {
        self.lock().node(node).map(|n| n.stats)
    }

    /// Frames currently queued for `node`.
    pub fn queued(&self, node: NodeId) -> Option<usize> {
        self.lock().node(node).map(|n| n.queue.len())
    }

    /// Slots currently reserved but not yet written for `node`.
    pub fn reserved(&self, node: NodeId) -> Option<usize> {
        self.lock().node(node).map(|n| n.reserved)
    }
}

impl Fabric for Vlan {
    fn lookup_node(&self, mac: MacAddr) -> Option<NodeId> {
        self.lock()
            .slots
            .iter()
            .flatten()
            .find(|n| n.mac == mac)
            .map(|n| n.id)
    }

    fn connected_count(&self) -> usize {
        self.lock().slots.len()
    }

    fn nth_connected(&self, index: usize) -> Option<NodeId> {
        self.lock().slots.get(index)?.as_ref().map(|n| n.id)
    }

    fn allocate_buffer(&self, node: NodeId, len: usize) -> Result<FabricBuffer, FabricError> {
        if len > self.config.max_frame_len {
            return Err(FabricError::FrameTooLarge {
                len,
                max: self.config.max_frame_len,
            });
        }

        let depth = self.config.queue_depth;
        let mut state = self.lock();
        let n = state.node_mut(node).ok_or(FabricError::UnknownNode(node))?;
        if n.queue.len() + n.reserved >= depth {
            n.stats.rejected_full += 1;
            return Err(FabricError::QueueFull {
                node,
                capacity: depth,
            });
        }
        n.reserved += 1;
        drop(state);

        let shared = Arc::clone(&self.state);
        Ok(FabricBuffer::new(node, len, move || {
            let mut state = shared
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(n) = state.node_mut(node) {
                n.reserved = n.reserved.saturating_sub(1);
            }
        }))
    }

    fn write(&self, buffer: FabricBuffer, data: &[u8]) -> Result<(), FabricError> {
        if data.len() > buffer.len() {
            return Err(FabricError::BufferTooSmall {
                len: data.len(),
                reserved: buffer.len(),
            });
        }

        let node = buffer.node();
        let mut state = self.lock();
        let Some(n) = state.node_mut(node) else {
            // The lease releases on drop, which needs the lock.
            drop(state);
            return Err(FabricError::UnknownNode(node));
        };
        buffer.commit();
        n.reserved = n.reserved.saturating_sub(1);
        n.queue.push_back(data.to_vec());
        n.stats.frames_enqueued += 1;
        Ok(())
    }

    fn signal(&self, node: NodeId) -> Result<(), FabricError> {
        let callback = {
            let mut state = self.lock();
            let n = state.node_mut(node).ok_or(FabricError::UnknownNode(node))?;
            n.stats.signals += 1;
            n.rx_ready.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }
}
