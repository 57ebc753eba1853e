use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use vnet_virtio::legacy::{
    VIRTIO_NET_F_MAC, VIRTIO_NET_HDR_LEN, VIRTIO_NET_QUEUE_RX, VIRTIO_NET_QUEUE_TX,
    VIRTIO_PCI_LEGACY_DEVICE_CFG, VIRTIO_PCI_LEGACY_GUEST_FEATURES,
    VIRTIO_PCI_LEGACY_HOST_FEATURES, VIRTIO_PCI_LEGACY_ISR, VIRTIO_PCI_LEGACY_QUEUE_NOTIFY,
    VIRTIO_PCI_LEGACY_QUEUE_NUM, VIRTIO_PCI_LEGACY_QUEUE_PFN, VIRTIO_PCI_LEGACY_QUEUE_SEL,
    VIRTIO_PCI_LEGACY_STATUS, VIRTIO_STATUS_ACKNOWLEDGE, VIRTIO_STATUS_DRIVER,
    VIRTIO_STATUS_DRIVER_OK,
};
use vnet_virtio::queue::{legacy_vring_addresses, VirtqDescFlags};
use vnet_virtio::{
    DmaCacheOp, DmaError, DmaManager, DmaRegion, GuestMemory, GuestRam, LegacyVirtioNet, LinkInfo,
    RawInterface, RingEmulation, RxCompletion, TxStatus,
};

const QUEUE_SIZE: u16 = 8;
const RX_PFN: u32 = 1;
const TX_PFN: u32 = 3;
const IRQ: u8 = 6;
const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

#[derive(Default)]
struct TestDma {
    outstanding: Cell<usize>,
}

impl DmaManager for TestDma {
    fn alloc(&self, size: usize, align: usize, cached: bool) -> Result<DmaRegion, DmaError> {
        assert!(cached);
        let region = DmaRegion::zeroed(size, align)?;
        self.outstanding.set(self.outstanding.get() + 1);
        Ok(region)
    }

    fn free(&self, _region: DmaRegion) {
        self.outstanding.set(self.outstanding.get() - 1);
    }

    fn pin(&self, region: &DmaRegion) -> u64 {
        region.host_addr()
    }

    fn unpin(&self, _region: &DmaRegion) {}

    fn cache_op(&self, _region: &DmaRegion, _op: DmaCacheOp) {}
}

struct RecordingRaw {
    frames: Vec<Vec<u8>>,
    raised: Vec<u8>,
    acked: Vec<u8>,
    verdict: TxStatus,
}

impl RawInterface for RecordingRaw {
    fn raw_tx(&mut self, frames: &[&[u8]]) -> TxStatus {
        self.frames.extend(frames.iter().map(|f| f.to_vec()));
        self.verdict
    }

    fn handle_irq(&mut self, irq: u8) {
        self.raised.push(irq);
    }

    fn ack_irq(&mut self, irq: u8) {
        self.acked.push(irq);
    }

    fn low_level_init(&mut self) -> LinkInfo {
        LinkInfo { mac: MAC, mtu: 1500 }
    }

    fn print_state(&self) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Harness {
    dev: LegacyVirtioNet,
    mem: Rc<RefCell<GuestRam>>,
    dma: Rc<TestDma>,
    rx_avail_idx: u16,
    tx_avail_idx: u16,
}

impl Harness {
    fn new() -> Self {
        let mem = Rc::new(RefCell::new(GuestRam::new(0x20000)));
        let dma = Rc::new(TestDma::default());
        let raw = RecordingRaw {
            frames: Vec::new(),
            raised: Vec::new(),
            acked: Vec::new(),
            verdict: TxStatus::Complete,
        };
        let dev = LegacyVirtioNet::new(
            Box::new(mem.clone()),
            dma.clone(),
            Box::new(raw),
            IRQ,
            QUEUE_SIZE,
        );
        Self {
            dev,
            mem,
            dma,
            rx_avail_idx: 0,
            tx_avail_idx: 0,
        }
    }

    fn driver_init(&mut self) {
        let dev = &mut self.dev;
        dev.io_out(VIRTIO_PCI_LEGACY_STATUS, 1, 0);
        dev.io_out(VIRTIO_PCI_LEGACY_STATUS, 1, u32::from(VIRTIO_STATUS_ACKNOWLEDGE));
        dev.io_out(
            VIRTIO_PCI_LEGACY_STATUS,
            1,
            u32::from(VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER),
        );
        let features = dev.io_in(VIRTIO_PCI_LEGACY_HOST_FEATURES, 4);
        dev.io_out(VIRTIO_PCI_LEGACY_GUEST_FEATURES, 4, features);
        for (queue, pfn) in [(VIRTIO_NET_QUEUE_RX, RX_PFN), (VIRTIO_NET_QUEUE_TX, TX_PFN)] {
            dev.io_out(VIRTIO_PCI_LEGACY_QUEUE_SEL, 2, u32::from(queue));
            assert_eq!(dev.io_in(VIRTIO_PCI_LEGACY_QUEUE_NUM, 2), u32::from(QUEUE_SIZE));
            dev.io_out(VIRTIO_PCI_LEGACY_QUEUE_PFN, 4, pfn);
        }
        dev.io_out(
            VIRTIO_PCI_LEGACY_STATUS,
            1,
            u32::from(VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_DRIVER_OK),
        );
    }

    fn write_desc(&self, pfn: u32, index: u16, addr: u64, len: u32, flags: VirtqDescFlags, next: u16) {
        let (desc, _, _) = legacy_vring_addresses(pfn, QUEUE_SIZE);
        let base = desc + u64::from(index) * 16;
        let mut mem = self.mem.borrow_mut();
        mem.write_u64_le(base, addr).unwrap();
        mem.write_u32_le(base + 8, len).unwrap();
        mem.write_u16_le(base + 12, flags.bits()).unwrap();
        mem.write_u16_le(base + 14, next).unwrap();
    }

    fn publish(&mut self, pfn: u32, head: u16) {
        let (_, avail, _) = legacy_vring_addresses(pfn, QUEUE_SIZE);
        let idx = if pfn == RX_PFN {
            &mut self.rx_avail_idx
        } else {
            &mut self.tx_avail_idx
        };
        let mut mem = self.mem.borrow_mut();
        mem.write_u16_le(avail + 4 + 2 * u64::from(*idx % QUEUE_SIZE), head)
            .unwrap();
        *idx = idx.wrapping_add(1);
        mem.write_u16_le(avail + 2, *idx).unwrap();
    }

    fn used_elem(&self, pfn: u32, slot: u16) -> (u32, u32) {
        let (_, _, used) = legacy_vring_addresses(pfn, QUEUE_SIZE);
        let mem = self.mem.borrow();
        let elem = used + 4 + 8 * u64::from(slot);
        (mem.read_u32_le(elem).unwrap(), mem.read_u32_le(elem + 4).unwrap())
    }

    fn post_rx_buffer(&mut self, head: u16, addr: u64, len: u32) {
        self.write_desc(RX_PFN, head, addr, len, VirtqDescFlags::WRITE, 0);
        self.publish(RX_PFN, head);
    }

    fn raw(&self) -> &RecordingRaw {
        self.dev.raw().as_any().downcast_ref::<RecordingRaw>().unwrap()
    }
}

#[test]
fn register_block_reports_features_queue_size_and_mac() {
    let mut h = Harness::new();
    let dev = &mut h.dev;

    assert_eq!(dev.io_in(VIRTIO_PCI_LEGACY_HOST_FEATURES, 4), VIRTIO_NET_F_MAC);
    // Unsupported feature bits are dropped.
    dev.io_out(VIRTIO_PCI_LEGACY_GUEST_FEATURES, 4, 0xFFFF_FFFF);
    assert_eq!(dev.io_in(VIRTIO_PCI_LEGACY_GUEST_FEATURES, 4), VIRTIO_NET_F_MAC);

    for (i, byte) in MAC.iter().enumerate() {
        assert_eq!(
            dev.io_in(VIRTIO_PCI_LEGACY_DEVICE_CFG + i as u16, 1),
            u32::from(*byte)
        );
    }
    assert_eq!(dev.io_in(VIRTIO_PCI_LEGACY_DEVICE_CFG, 4), 0x0000_0002);
    assert_eq!(dev.io_in(VIRTIO_PCI_LEGACY_DEVICE_CFG + 6, 2), 1);

    dev.io_out(VIRTIO_PCI_LEGACY_QUEUE_SEL, 2, 2);
    assert_eq!(dev.io_in(VIRTIO_PCI_LEGACY_QUEUE_NUM, 2), 0);
    dev.io_out(VIRTIO_PCI_LEGACY_QUEUE_PFN, 4, 7);
    assert_eq!(dev.io_in(VIRTIO_PCI_LEGACY_QUEUE_PFN, 4), 0);

    dev.io_out(VIRTIO_PCI_LEGACY_QUEUE_SEL, 2, 1);
    dev.io_out(VIRTIO_PCI_LEGACY_QUEUE_PFN, 4, TX_PFN);
    assert_eq!(dev.io_in(VIRTIO_PCI_LEGACY_QUEUE_PFN, 4), TX_PFN);
    assert_eq!(dev.link().mtu, 1500);
}

#[test]
fn tx_strips_header_completes_chain_and_interrupts() {
    let mut h = Harness::new();
    h.driver_init();

    let frame: Vec<u8> = (0..60u8).collect();
    {
        let mut mem = h.mem.borrow_mut();
        mem.write_from(0x8000, &[0xAA; VIRTIO_NET_HDR_LEN]).unwrap();
        mem.write_from(0x9000, &frame).unwrap();
    }
    h.write_desc(TX_PFN, 0, 0x8000, VIRTIO_NET_HDR_LEN as u32, VirtqDescFlags::NEXT, 1);
    h.write_desc(TX_PFN, 1, 0x9000, frame.len() as u32, VirtqDescFlags::empty(), 0);
    h.publish(TX_PFN, 0);

    h.dev
        .io_out(VIRTIO_PCI_LEGACY_QUEUE_NOTIFY, 2, u32::from(VIRTIO_NET_QUEUE_TX));

    assert_eq!(h.raw().frames, vec![frame]);
    assert_eq!(h.raw().raised, vec![IRQ]);
    assert_eq!(h.dev.used_idx(VIRTIO_NET_QUEUE_TX), Some(1));
    assert_eq!(h.used_elem(TX_PFN, 0), (0, 0));
    assert_eq!(h.dev.stats().tx_frames, 1);
    assert_eq!(h.dma.outstanding.get(), 0);

    assert_eq!(h.dev.io_in(VIRTIO_PCI_LEGACY_ISR, 1), 1);
    assert_eq!(h.raw().acked, vec![IRQ]);
    assert_eq!(h.dev.io_in(VIRTIO_PCI_LEGACY_ISR, 1), 0);
}

#[test]
fn tx_chain_with_device_writable_buffer_is_not_transmitted() {
    let mut h = Harness::new();
    h.driver_init();

    h.write_desc(TX_PFN, 0, 0x8000, 64, VirtqDescFlags::WRITE, 0);
    h.publish(TX_PFN, 0);
    h.dev
        .io_out(VIRTIO_PCI_LEGACY_QUEUE_NOTIFY, 2, u32::from(VIRTIO_NET_QUEUE_TX));

    assert!(h.raw().frames.is_empty());
    assert_eq!(h.dev.used_idx(VIRTIO_NET_QUEUE_TX), Some(1));
    assert_eq!(h.dev.stats().tx_malformed, 1);
}

#[test]
fn rx_buffer_receives_zero_header_and_frame() {
    let mut h = Harness::new();
    h.driver_init();
    h.post_rx_buffer(0, 0xA000, 2048);

    let frame = [0x5Au8; 60];
    let mut buf = h.dev.allocate_rx_buf(frame.len()).expect("rx buffer posted");
    assert_eq!(buf.len(), frame.len());
    assert_eq!(h.dma.outstanding.get(), 1);
    buf.as_mut_slice().copy_from_slice(&frame);
    h.dev.rx_complete(vec![RxCompletion {
        buf,
        len: frame.len(),
    }]);

    let mut written = [0xFFu8; VIRTIO_NET_HDR_LEN + 60];
    h.mem.borrow().read_into(0xA000, &mut written).unwrap();
    assert_eq!(&written[..VIRTIO_NET_HDR_LEN], &[0u8; VIRTIO_NET_HDR_LEN]);
    assert_eq!(&written[VIRTIO_NET_HDR_LEN..], &frame);
    assert_eq!(h.used_elem(RX_PFN, 0), (0, 70));
    assert_eq!(h.raw().raised, vec![IRQ]);
    assert_eq!(h.dma.outstanding.get(), 0);
    assert_eq!(h.dev.stats().rx_frames, 1);
}

#[test]
fn rx_without_posted_buffer_drops() {
    let mut h = Harness::new();
    h.driver_init();

    assert!(h.dev.allocate_rx_buf(60).is_none());
    assert_eq!(h.dev.stats().rx_no_buffer, 1);
    assert_eq!(h.dma.outstanding.get(), 0);
    assert!(h.raw().raised.is_empty());
}

#[test]
fn rx_buffer_too_small_is_returned_empty() {
    let mut h = Harness::new();
    h.driver_init();
    h.post_rx_buffer(0, 0xA000, 32);

    assert!(h.dev.allocate_rx_buf(60).is_none());
    assert_eq!(h.dev.stats().rx_too_small, 1);
    assert_eq!(h.used_elem(RX_PFN, 0), (0, 0));
    assert_eq!(h.dma.outstanding.get(), 0);
    assert_eq!(h.raw().raised, vec![IRQ]);
}

#[test]
fn rx_is_refused_before_driver_ok() {
    let mut h = Harness::new();
    h.post_rx_buffer(0, 0xA000, 2048);
    assert!(h.dev.allocate_rx_buf(60).is_none());
    assert_eq!(h.dma.outstanding.get(), 0);
}

#[test]
fn wide_status_read_includes_and_clears_isr() {
    let mut h = Harness::new();
    h.driver_init();
    h.post_rx_buffer(0, 0xA000, 2048);
    let buf = h.dev.allocate_rx_buf(14).unwrap();
    h.dev.rx_complete(vec![RxCompletion { buf, len: 14 }]);
    assert_eq!(h.raw().raised, vec![IRQ]);

    let status = u32::from(VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_DRIVER_OK);
    assert_eq!(h.dev.io_in(VIRTIO_PCI_LEGACY_STATUS, 2), status | 1 << 8);
    assert_eq!(h.raw().acked, vec![IRQ]);
    assert_eq!(h.dev.io_in(VIRTIO_PCI_LEGACY_ISR, 1), 0);

    // Four bytes reach the first two MAC octets.
    let wide = h.dev.io_in(VIRTIO_PCI_LEGACY_STATUS, 4);
    assert_eq!(wide, status | u32::from(MAC[0]) << 16 | u32::from(MAC[1]) << 24);
    assert_eq!(h.dev.io_in(VIRTIO_PCI_LEGACY_STATUS, 1), status);
}

#[test]
fn status_zero_resets_queues_and_lowers_line() {
    let mut h = Harness::new();
    h.driver_init();
    h.post_rx_buffer(0, 0xA000, 2048);
    let buf = h.dev.allocate_rx_buf(14).unwrap();
    h.dev.rx_complete(vec![RxCompletion { buf, len: 14 }]);
    assert_eq!(h.raw().raised, vec![IRQ]);

    h.dev.io_out(VIRTIO_PCI_LEGACY_STATUS, 1, 0);
    assert_eq!(h.dev.status(), 0);
    assert_eq!(h.raw().acked, vec![IRQ]);
    assert_eq!(h.dev.used_idx(VIRTIO_NET_QUEUE_RX), None);
    assert_eq!(h.dev.io_in(VIRTIO_PCI_LEGACY_ISR, 1), 0);
}
