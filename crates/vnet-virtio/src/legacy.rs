//! Legacy (virtio 0.9) virtio-pci network function behind a port-I/O BAR.
//!
//! Queue 0 receives, queue 1 transmits. Every buffer starts with the 10-byte legacy
//! `virtio_net_hdr`; no offloads are offered, so the header is zero on receive and ignored on
//! transmit.

use crate::dma::{DmaManager, DMA_ALIGN};
use crate::emulation::{RingEmulation, RxBuffer, RxCompletion};
use crate::memory::{GuestMemory, GuestMemoryError};
use crate::queue::{DescriptorChain, VirtQueue, VirtQueueError};
use crate::raw::{LinkInfo, RawInterface, TxStatus};
use std::rc::Rc;

pub const VIRTIO_NET_F_MAC: u32 = 1 << 5;
pub const VIRTIO_NET_S_LINK_UP: u16 = 1;
pub const VIRTIO_NET_HDR_LEN: usize = 10;

pub const VIRTIO_NET_QUEUE_RX: u16 = 0;
pub const VIRTIO_NET_QUEUE_TX: u16 = 1;

pub const VIRTIO_PCI_LEGACY_HOST_FEATURES: u16 = 0x00; // u32
pub const VIRTIO_PCI_LEGACY_GUEST_FEATURES: u16 = 0x04; // u32
pub const VIRTIO_PCI_LEGACY_QUEUE_PFN: u16 = 0x08; // u32
pub const VIRTIO_PCI_LEGACY_QUEUE_NUM: u16 = 0x0c; // u16
pub const VIRTIO_PCI_LEGACY_QUEUE_SEL: u16 = 0x0e; // u16
pub const VIRTIO_PCI_LEGACY_QUEUE_NOTIFY: u16 = 0x10; // u16
pub const VIRTIO_PCI_LEGACY_STATUS: u16 = 0x12; // u8
pub const VIRTIO_PCI_LEGACY_ISR: u16 = 0x13; // u8 (read clears)
pub const VIRTIO_PCI_LEGACY_DEVICE_CFG: u16 = 0x14; // mac[6], status u16

/// Bytes of the register block including the net device config.
pub const VIRTIO_NET_LEGACY_REGS_LEN: u16 = VIRTIO_PCI_LEGACY_DEVICE_CFG + 8;

pub const VIRTIO_PCI_LEGACY_ISR_QUEUE: u8 = 0x01;

pub const VIRTIO_STATUS_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_STATUS_DRIVER: u8 = 2;
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 4;
pub const VIRTIO_STATUS_FAILED: u8 = 0x80;

/// Largest frame accepted from a TX chain (header excluded).
const MAX_TX_FRAME: usize = 65_535;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LegacyNetStats {
    pub tx_frames: u64,
    pub tx_failed: u64,
    pub tx_malformed: u64,
    pub tx_staging_failed: u64,
    pub rx_frames: u64,
    pub rx_no_buffer: u64,
    pub rx_too_small: u64,
    pub rx_malformed: u64,
    pub rx_staging_failed: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    pfn: u32,
    queue: Option<VirtQueue>,
}

pub struct LegacyVirtioNet {
    mem: Box<dyn GuestMemory>,
    dma: Rc<dyn DmaManager>,
    raw: Box<dyn RawInterface>,
    link: LinkInfo,
    irq: u8,
    queue_size: u16,
    queues: [QueueState; 2],
    queue_select: u16,
    guest_features: u32,
    status: u8,
    isr: u8,
    irq_asserted: bool,
    stats: LegacyNetStats,
}

impl LegacyVirtioNet {
    /// Builds the emulation and asks `raw` for the link parameters.
    ///
    /// # Panics
    ///
    /// Panics if `queue_size` is not a power of two.
    pub fn new(
        mem: Box<dyn GuestMemory>,
        dma: Rc<dyn DmaManager>,
        mut raw: Box<dyn RawInterface>,
        irq: u8,
        queue_size: u16,
    ) -> Self {
        assert!(
            queue_size.is_power_of_two(),
            "virtqueue size must be a power of two"
        );
        let link = raw.low_level_init();
        tracing::debug!(mac = ?link.mac, mtu = link.mtu, irq, queue_size, "legacy virtio-net up");
        Self {
            mem,
            dma,
            raw,
            link,
            irq,
            queue_size,
            queues: Default::default(),
            queue_select: 0,
            guest_features: 0,
            status: 0,
            isr: 0,
            irq_asserted: false,
            stats: LegacyNetStats::default(),
        }
    }

    pub fn link(&self) -> LinkInfo {
        self.link
    }

    pub fn stats(&self) -> LegacyNetStats {
        self.stats
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn irq_line(&self) -> u8 {
        self.irq
    }

    /// Current `used.idx` of `queue`, if the guest configured it.
    pub fn used_idx(&self, queue: u16) -> Option<u16> {
        let q = self.queues.get(usize::from(queue))?.queue.as_ref()?;
        self.mem.read_u16_le(q.used_addr() + 2).ok()
    }

    fn device_config(&self) -> [u8; 8] {
        let mut cfg = [0u8; 8];
        cfg[..6].copy_from_slice(&self.link.mac);
        cfg[6..].copy_from_slice(&VIRTIO_NET_S_LINK_UP.to_le_bytes());
        cfg
    }

    fn reset(&mut self) {
        self.queues = Default::default();
        self.queue_select = 0;
        self.guest_features = 0;
        self.status = 0;
        self.isr = 0;
        if self.irq_asserted {
            self.raw.ack_irq(self.irq);
            self.irq_asserted = false;
        }
        tracing::debug!("legacy virtio-net reset");
    }

    fn set_queue_pfn(&mut self, pfn: u32) {
        let queue_size = self.queue_size;
        let Some(q) = self.queues.get_mut(usize::from(self.queue_select)) else {
            return;
        };
        q.pfn = pfn;
        q.queue = (pfn != 0).then(|| VirtQueue::new_legacy(queue_size, pfn));
    }

    fn notify(&mut self, queue: u16) {
        match queue {
            VIRTIO_NET_QUEUE_TX => self.process_tx(),
            // Receive buffers are consumed when frames arrive from the link.
            VIRTIO_NET_QUEUE_RX => {}
            other => tracing::warn!(queue = other, "notify for nonexistent queue"),
        }
    }

    fn signal_queue_interrupt(&mut self) {
        self.isr |= VIRTIO_PCI_LEGACY_ISR_QUEUE;
        if !self.irq_asserted {
            self.raw.handle_irq(self.irq);
            self.irq_asserted = true;
        }
    }

    fn read_isr_and_clear(&mut self) -> u8 {
        let isr = self.isr;
        self.isr = 0;
        if self.irq_asserted {
            self.raw.ack_irq(self.irq);
            self.irq_asserted = false;
        }
        isr
    }

    /// Byte `i` of the window starting at the status register.
    fn status_window_byte(&mut self, i: u16) -> u8 {
        match VIRTIO_PCI_LEGACY_STATUS + i {
            VIRTIO_PCI_LEGACY_STATUS => self.status,
            VIRTIO_PCI_LEGACY_ISR => self.read_isr_and_clear(),
            off => self
                .device_config()
                .get(usize::from(off - VIRTIO_PCI_LEGACY_DEVICE_CFG))
                .copied()
                .unwrap_or(0),
        }
    }

    /// Publishes a used element on `queue`; returns whether the guest wants an interrupt.
    fn complete(&mut self, queue: u16, head: u16, len: u32) -> bool {
        let Some(q) = self.queues[usize::from(queue)].queue.as_mut() else {
            return false;
        };
        match q.add_used(&mut *self.mem, head, len) {
            Ok(irq) => irq,
            Err(err) => {
                tracing::warn!(%err, queue, head, "failed to publish used element");
                false
            }
        }
    }

    fn pop_chain(&mut self, queue: u16) -> Result<Option<DescriptorChain>, VirtQueueError> {
        match self.queues[usize::from(queue)].queue.as_mut() {
            Some(q) => q.pop_descriptor_chain(&*self.mem),
            None => Ok(None),
        }
    }

    fn process_tx(&mut self) {
        let mut need_irq = false;
        loop {
            let chain = match self.pop_chain(VIRTIO_NET_QUEUE_TX) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "malformed TX descriptor chain");
                    self.stats.tx_malformed += 1;
                    match err.head() {
                        Some(head) => {
                            need_irq |= self.complete(VIRTIO_NET_QUEUE_TX, head, 0);
                            continue;
                        }
                        None => break,
                    }
                }
            };

            if let Some(frame) = self.gather_tx_frame(&chain) {
                self.transmit(&frame);
            }
            // Consumed either way: a chain is never handed to the link twice.
            need_irq |= self.complete(VIRTIO_NET_QUEUE_TX, chain.head_index(), 0);
        }

        if need_irq {
            self.signal_queue_interrupt();
        }
    }

    fn gather_tx_frame(&mut self, chain: &DescriptorChain) -> Option<Vec<u8>> {
        let mut bytes = Vec::new();
        for d in chain.descriptors() {
            let start = bytes.len();
            let len = d.len as usize;
            if d.is_write_only() || start + len > VIRTIO_NET_HDR_LEN + MAX_TX_FRAME {
                tracing::warn!(head = chain.head_index(), "TX chain has a write-only or oversized buffer");
                self.stats.tx_malformed += 1;
                return None;
            }
            bytes.resize(start + len, 0);
            if let Err(err) = self.mem.read_into(d.addr, &mut bytes[start..]) {
                tracing::warn!(%err, head = chain.head_index(), "TX buffer outside guest memory");
                self.stats.tx_malformed += 1;
                return None;
            }
        }

        if bytes.len() < VIRTIO_NET_HDR_LEN {
            tracing::warn!(len = bytes.len(), "TX chain shorter than virtio_net_hdr");
            self.stats.tx_malformed += 1;
            return None;
        }
        bytes.drain(..VIRTIO_NET_HDR_LEN);
        Some(bytes)
    }

    fn transmit(&mut self, frame: &[u8]) {
        let mut region = match self.dma.alloc(frame.len(), DMA_ALIGN, true) {
            Ok(region) => region,
            Err(err) => {
                tracing::warn!(%err, len = frame.len(), "no staging buffer for TX frame, dropping");
                self.stats.tx_staging_failed += 1;
                return;
            }
        };
        region.as_mut_slice().copy_from_slice(frame);

        match self.raw.raw_tx(&[region.as_slice()]) {
            TxStatus::Complete => self.stats.tx_frames += 1,
            TxStatus::Failed => self.stats.tx_failed += 1,
        }
        self.dma.free(region);
    }

    fn write_rx_chain(&mut self, chain: &DescriptorChain, frame: &[u8]) -> Result<u32, GuestMemoryError> {
        let mut payload = Vec::with_capacity(VIRTIO_NET_HDR_LEN + frame.len());
        payload.extend_from_slice(&[0u8; VIRTIO_NET_HDR_LEN]);
        payload.extend_from_slice(frame);

        let mut remaining = payload.as_slice();
        for d in chain.descriptors() {
            if remaining.is_empty() {
                break;
            }
            let take = remaining.len().min(d.len as usize);
            self.mem.write_from(d.addr, &remaining[..take])?;
            remaining = &remaining[take..];
        }
        Ok((payload.len() - remaining.len()) as u32)
    }
}

impl RingEmulation for LegacyVirtioNet {
    fn io_in(&mut self, offset: u16, size: u8) -> u32 {
        let selected = usize::from(self.queue_select);
        let value = match offset {
            VIRTIO_PCI_LEGACY_HOST_FEATURES => VIRTIO_NET_F_MAC,
            VIRTIO_PCI_LEGACY_GUEST_FEATURES => self.guest_features,
            VIRTIO_PCI_LEGACY_QUEUE_PFN => self.queues.get(selected).map(|q| q.pfn).unwrap_or(0),
            VIRTIO_PCI_LEGACY_QUEUE_NUM => {
                if selected < self.queues.len() {
                    u32::from(self.queue_size)
                } else {
                    0
                }
            }
            VIRTIO_PCI_LEGACY_QUEUE_SEL => u32::from(self.queue_select),
            // Wider reads span the ISR byte, read-clear included, and the config after it.
            VIRTIO_PCI_LEGACY_STATUS => (0..u32::from(size.min(4))).fold(0, |acc, i| {
                acc | u32::from(self.status_window_byte(i as u16)) << (8 * i)
            }),
            VIRTIO_PCI_LEGACY_ISR => u32::from(self.read_isr_and_clear()),
            off if off >= VIRTIO_PCI_LEGACY_DEVICE_CFG => {
                let cfg = self.device_config();
                let start = usize::from(off - VIRTIO_PCI_LEGACY_DEVICE_CFG);
                let mut buf = [0u8; 4];
                for (i, byte) in buf.iter_mut().enumerate().take(usize::from(size.min(4))) {
                    *byte = cfg.get(start + i).copied().unwrap_or(0);
                }
                u32::from_le_bytes(buf)
            }
            _ => 0,
        };
        value & size_mask(size)
    }

    fn io_out(&mut self, offset: u16, size: u8, value: u32) {
        let value = value & size_mask(size);
        match offset {
            VIRTIO_PCI_LEGACY_GUEST_FEATURES => self.guest_features = value & VIRTIO_NET_F_MAC,
            VIRTIO_PCI_LEGACY_QUEUE_PFN => self.set_queue_pfn(value),
            VIRTIO_PCI_LEGACY_QUEUE_SEL => self.queue_select = value as u16,
            VIRTIO_PCI_LEGACY_QUEUE_NOTIFY => self.notify(value as u16),
            VIRTIO_PCI_LEGACY_STATUS => {
                let status = value as u8;
                if status == 0 {
                    self.reset();
                } else {
                    self.status = status;
                }
            }
            _ => tracing::debug!(offset, size, value, "write to read-only legacy register ignored"),
        }
    }

    fn allocate_rx_buf(&mut self, len: usize) -> Option<RxBuffer> {
        if self.status & VIRTIO_STATUS_DRIVER_OK == 0 {
            self.stats.rx_no_buffer += 1;
            return None;
        }

        let region = match self.dma.alloc(len, DMA_ALIGN, true) {
            Ok(region) => region,
            Err(err) => {
                tracing::warn!(%err, len, "no staging buffer for RX frame");
                self.stats.rx_staging_failed += 1;
                return None;
            }
        };

        let chain = match self.pop_chain(VIRTIO_NET_QUEUE_RX) {
            Ok(Some(chain)) => chain,
            Ok(None) => {
                self.stats.rx_no_buffer += 1;
                self.dma.free(region);
                return None;
            }
            Err(err) => {
                tracing::warn!(%err, "malformed RX descriptor chain");
                self.stats.rx_malformed += 1;
                self.dma.free(region);
                if let Some(head) = err.head() {
                    if self.complete(VIRTIO_NET_QUEUE_RX, head, 0) {
                        self.signal_queue_interrupt();
                    }
                }
                return None;
            }
        };

        let needed = (VIRTIO_NET_HDR_LEN + len) as u64;
        match chain.writable_len() {
            Some(capacity) if capacity >= needed => Some(RxBuffer { region, chain }),
            capacity => {
                match capacity {
                    Some(capacity) => {
                        tracing::warn!(capacity, needed, "RX buffer too small, dropping frame");
                        self.stats.rx_too_small += 1;
                    }
                    None => {
                        tracing::warn!(head = chain.head_index(), "RX chain has a device-readable buffer");
                        self.stats.rx_malformed += 1;
                    }
                }
                self.dma.free(region);
                if self.complete(VIRTIO_NET_QUEUE_RX, chain.head_index(), 0) {
                    self.signal_queue_interrupt();
                }
                None
            }
        }
    }

    fn rx_complete(&mut self, completions: Vec<RxCompletion>) {
        let mut need_irq = false;
        for RxCompletion { buf, len } in completions {
            let RxBuffer { region, chain } = buf;
            let len = len.min(region.len());
            let written = match self.write_rx_chain(&chain, &region.as_slice()[..len]) {
                Ok(written) => {
                    self.stats.rx_frames += 1;
                    written
                }
                Err(err) => {
                    tracing::warn!(%err, head = chain.head_index(), "RX buffer outside guest memory");
                    self.stats.rx_malformed += 1;
                    0
                }
            };
            self.dma.free(region);
            need_irq |= self.complete(VIRTIO_NET_QUEUE_RX, chain.head_index(), written);
        }

        if need_irq {
            self.signal_queue_interrupt();
        }
    }

    fn raw(&self) -> &dyn RawInterface {
        &*self.raw
    }

    fn raw_mut(&mut self) -> &mut dyn RawInterface {
        &mut *self.raw
    }
}

fn size_mask(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}
