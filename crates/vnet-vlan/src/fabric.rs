//! The [`Fabric`] contract: node lookup, buffer leases, writes and wake-up signals.

use crate::mac::MacAddr;
use core::fmt;

/// Identity of one node on a fabric. Stable for the node's lifetime, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum FabricError {
    #[error("{0} is not connected")]
    UnknownNode(NodeId),

    #[error("{node} has no free buffers ({capacity} in use)")]
    QueueFull { node: NodeId, capacity: usize },

    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("{len} bytes do not fit a {reserved}-byte buffer")]
    BufferTooSmall { len: usize, reserved: usize },

    #[error("MAC {0} is already connected")]
    DuplicateMac(MacAddr),
}

/// A reserved slot in a destination node's queue.
///
/// The reservation is handed back when the lease is dropped without being passed to
/// [`Fabric::write`], so an abandoned transmission never leaks queue capacity.
pub struct FabricBuffer {
    node: NodeId,
    len: usize,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl FabricBuffer {
    /// Creates a lease; `release` runs if the lease is dropped before [`Self::commit`].
    pub fn new(node: NodeId, len: usize, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            node,
            len,
            release: Some(Box::new(release)),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumes the lease without releasing the reservation. Called by the fabric once the
    /// reserved slot holds a frame.
    pub fn commit(mut self) -> (NodeId, usize) {
        self.release = None;
        (self.node, self.len)
    }
}

impl Drop for FabricBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for FabricBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricBuffer")
            .field("node", &self.node)
            .field("len", &self.len)
            .field("armed", &self.release.is_some())
            .finish()
    }
}

/// A multi-node packet distribution fabric shared between guests.
///
/// Nodes live in a slot table. [`Fabric::connected_count`] is the number of slots and
/// [`Fabric::nth_connected`] returns `None` for a slot whose node has gone away.
pub trait Fabric: Send + Sync {
    fn lookup_node(&self, mac: MacAddr) -> Option<NodeId>;

    fn connected_count(&self) -> usize;

    fn nth_connected(&self, index: usize) -> Option<NodeId>;

    /// Reserves room for one `len`-byte frame in `node`'s queue.
    fn allocate_buffer(&self, node: NodeId, len: usize) -> Result<FabricBuffer, FabricError>;

    /// Copies `data` into the reserved slot and enqueues it.
    fn write(&self, buffer: FabricBuffer, data: &[u8]) -> Result<(), FabricError>;

    /// Notifies `node` that frames are waiting.
    fn signal(&self, node: NodeId) -> Result<(), FabricError>;
}

impl<T: Fabric + ?Sized> Fabric for std::sync::Arc<T> {
    fn lookup_node(&self, mac: MacAddr) -> Option<NodeId> {
        <T as Fabric>::lookup_node(&**self, mac)
    }

    fn connected_count(&self) -> usize {
        <T as Fabric>::connected_count(&**self)
    }

    fn nth_connected(&self, index: usize) -> Option<NodeId> {
        <T as Fabric>::nth_connected(&**self, index)
    }

    fn allocate_buffer(&self, node: NodeId, len: usize) -> Result<FabricBuffer, FabricError> {
        <T as Fabric>::allocate_buffer(&**self, node, len)
    }

    fn write(&self, buffer: FabricBuffer, data: &[u8]) -> Result<(), FabricError> {
        <T as Fabric>::write(&**self, buffer, data)
    }

    fn signal(&self, node: NodeId) -> Result<(), FabricError> {
        <T as Fabric>::signal(&**self, node)
    }
}
