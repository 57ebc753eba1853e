#![allow(dead_code)]

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use vnet_nic::{GuestLink, HeapDma};
use vnet_virtio::queue::{Descriptor, VirtqDescFlags};
use vnet_virtio::{
    DescriptorChain, DmaManager, LinkInfo, RawInterface, RingEmulation, RxBuffer, RxCompletion,
    TxStatus, DMA_ALIGN,
};
use vnet_vlan::{Fabric, FabricBuffer, FabricError, MacAddr, NodeId, RxPoll};

pub fn mac(last: u8) -> MacAddr {
    MacAddr([0x02, 0, 0, 0, 0, last])
}

/// Minimal Ethernet frame from `src` to `dst` with `payload` after the header.
pub fn frame(dst: MacAddr, src: MacAddr, payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(14 + payload.len());
    f.extend_from_slice(&dst.octets());
    f.extend_from_slice(&src.octets());
    f.extend_from_slice(&[0x88, 0xb5]);
    f.extend_from_slice(payload);
    f
}

#[derive(Default)]
pub struct FabricLog {
    slots: Vec<Option<(NodeId, MacAddr)>>,
    /// Remaining buffers per node; nodes without an entry never run out.
    credits: HashMap<NodeId, usize>,
    failing_signals: BTreeSet<NodeId>,
    failing_writes: BTreeSet<NodeId>,
    pub writes: Vec<(NodeId, Vec<u8>)>,
    pub signals: Vec<NodeId>,
}

/// Fabric double that records every write and signal.
#[derive(Default)]
pub struct RecordingFabric {
    log: Mutex<FabricLog>,
    leases: Arc<AtomicUsize>,
    next_id: AtomicUsize,
}

impl RecordingFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MutexGuard<'_, FabricLog> {
        self.log.lock().unwrap()
    }

    pub fn add_node(&self, mac: MacAddr) -> NodeId {
        let id = NodeId(self.next_id.fetch_add(1, Ordering::SeqCst) as u32);
        self.log().slots.push(Some((id, mac)));
        id
    }

    pub fn add_hole(&self) {
        self.log().slots.push(None);
    }

    pub fn set_credits(&self, node: NodeId, buffers: usize) {
        self.log().credits.insert(node, buffers);
    }

    pub fn fail_signals_to(&self, node: NodeId) {
        self.log().failing_signals.insert(node);
    }

    /// Writes to `node` fail as if its buffer had shrunk, leaving the lease to be dropped.
    pub fn fail_writes_to(&self, node: NodeId) {
        self.log().failing_writes.insert(node);
    }

    pub fn writes_to(&self, node: NodeId) -> Vec<Vec<u8>> {
        self.log()
            .writes
            .iter()
            .filter(|(n, _)| *n == node)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn signals_to(&self, node: NodeId) -> usize {
        self.log().signals.iter().filter(|&&n| n == node).count()
    }

    pub fn total_writes(&self) -> usize {
        self.log().writes.len()
    }

    pub fn total_signals(&self) -> usize {
        self.log().signals.len()
    }

    /// Leases handed out and neither written nor dropped.
    pub fn outstanding_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

impl Fabric for RecordingFabric {
    fn lookup_node(&self, mac: MacAddr) -> Option<NodeId> {
        self.log()
            .slots
            .iter()
            .flatten()
            .find(|(_, m)| *m == mac)
            .map(|(id, _)| *id)
    }

    fn connected_count(&self) -> usize {
        self.log().slots.len()
    }

    fn nth_connected(&self, index: usize) -> Option<NodeId> {
        self.log().slots.get(index)?.map(|(id, _)| id)
    }

    fn allocate_buffer(&self, node: NodeId, len: usize) -> Result<FabricBuffer, FabricError> {
        if let Some(credits) = self.log().credits.get_mut(&node) {
            if *credits == 0 {
                return Err(FabricError::QueueFull { node, capacity: 0 });
            }
            *credits -= 1;
        }
        self.leases.fetch_add(1, Ordering::SeqCst);
        let leases = Arc::clone(&self.leases);
        Ok(FabricBuffer::new(node, len, move || {
            leases.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    fn write(&self, buffer: FabricBuffer, data: &[u8]) -> Result<(), FabricError> {
        if self.log().failing_writes.contains(&buffer.node()) {
            return Err(FabricError::BufferTooSmall {
                len: data.len(),
                reserved: 0,
            });
        }
        let (node, _) = buffer.commit();
        self.leases.fetch_sub(1, Ordering::SeqCst);
        self.log().writes.push((node, data.to_vec()));
        Ok(())
    }

    fn signal(&self, node: NodeId) -> Result<(), FabricError> {
        let mut log = self.log();
        if log.failing_signals.contains(&node) {
            return Err(FabricError::UnknownNode(node));
        }
        log.signals.push(node);
        Ok(())
    }
}

/// Guest link fed from a script of frames.
pub struct ScriptedLink {
    mac: MacAddr,
    queue: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    pub polls: usize,
}

impl ScriptedLink {
    pub fn new(mac: MacAddr, frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            mac,
            queue: frames.into_iter().collect(),
            current: Vec::new(),
            polls: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl GuestLink for ScriptedLink {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn poll_receive(&mut self) -> RxPoll {
        self.polls += 1;
        match self.queue.pop_front() {
            None => RxPoll::None,
            Some(frame) => {
                let len = frame.len();
                self.current = frame;
                if self.queue.is_empty() {
                    RxPoll::Last(len)
                } else {
                    RxPoll::More(len)
                }
            }
        }
    }

    fn rx_frame(&self) -> &[u8] {
        &self.current
    }
}

/// Raw interface that only records.
#[derive(Default)]
pub struct NullRaw {
    pub frames: Vec<Vec<u8>>,
}

impl RawInterface for NullRaw {
    fn raw_tx(&mut self, frames: &[&[u8]]) -> TxStatus {
        self.frames.extend(frames.iter().map(|f| f.to_vec()));
        TxStatus::Complete
    }

    fn handle_irq(&mut self, _irq: u8) {}

    fn low_level_init(&mut self) -> LinkInfo {
        LinkInfo {
            mac: mac(1).octets(),
            mtu: 1500,
        }
    }

    fn print_state(&self) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Ring emulation double with a fixed number of guest receive buffers.
pub struct RecordingEmulation {
    pub dma: Rc<HeapDma>,
    pub rx_buffers: usize,
    pub buffer_len: usize,
    pub delivered: Vec<Vec<u8>>,
    pub completion_batches: Vec<usize>,
    /// Port accesses as `(offset, size, written value)`.
    pub io: Rc<RefCell<Vec<(u16, u8, Option<u32>)>>>,
    raw: NullRaw,
    next_head: u16,
}

impl RecordingEmulation {
    pub fn new(dma: Rc<HeapDma>, rx_buffers: usize) -> Self {
        Self {
            dma,
            rx_buffers,
            buffer_len: 2048,
            delivered: Vec::new(),
            completion_batches: Vec::new(),
            io: Rc::default(),
            raw: NullRaw::default(),
            next_head: 0,
        }
    }
}

impl RingEmulation for RecordingEmulation {
    fn io_in(&mut self, offset: u16, size: u8) -> u32 {
        self.io.borrow_mut().push((offset, size, None));
        u32::from(offset)
    }

    fn io_out(&mut self, offset: u16, size: u8, value: u32) {
        self.io.borrow_mut().push((offset, size, Some(value)));
    }

    fn allocate_rx_buf(&mut self, len: usize) -> Option<RxBuffer> {
        if self.rx_buffers == 0 || len > self.buffer_len {
            return None;
        }
        self.rx_buffers -= 1;
        let region = self.dma.alloc(len, DMA_ALIGN, true).ok()?;
        let head = self.next_head;
        self.next_head = self.next_head.wrapping_add(1);
        let chain = DescriptorChain::new(
            head,
            vec![Descriptor {
                addr: 0x1000,
                len: self.buffer_len as u32,
                flags: VirtqDescFlags::WRITE,
                next: 0,
            }],
        );
        Some(RxBuffer::new(region, chain))
    }

    fn rx_complete(&mut self, completions: Vec<RxCompletion>) {
        self.completion_batches.push(completions.len());
        for RxCompletion { buf, len } in completions {
            let (region, _chain) = buf.into_parts();
            self.delivered.push(region.as_slice()[..len].to_vec());
            self.dma.free(region);
        }
    }

    fn raw(&self) -> &dyn RawInterface {
        &self.raw
    }

    fn raw_mut(&mut self) -> &mut dyn RawInterface {
        &mut self.raw
    }
}
