//! The device instance and its attachment to a guest platform.

use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use vnet_pci::PciBdf;
use vnet_pci::PciBus;
use vnet_platform::{IoPortBus, IrqController};
use vnet_virtio::legacy::VIRTIO_PCI_LEGACY_STATUS;
use vnet_virtio::{GuestMemory, LegacyVirtioNet, RingEmulation};
use vnet_vlan::{Fabric, MacAddr, RxPoll};

use crate::config::{VirtioNetConfig, VIRTIO_NET_DEVICE_ID, VIRTIO_NET_VENDOR_ID};
use crate::dma::HeapDma;
use crate::error::AttachError;
use crate::link::GuestLink;
use crate::pci::{VirtioNetIoBar, VirtioNetPciFunction};
use crate::router::{TxStats, VlanRouter};
use crate::rx::{drain_rx, RxDrainCounts, RxStats};

/// One guest's virtio network device.
pub struct VirtioNetDevice {
    bdf: PciBdf,
    iobase: u16,
    emul: Box<dyn RingEmulation>,
    link: Box<dyn GuestLink>,
    dma: Rc<HeapDma>,
    rx_stats: RxStats,
}

impl VirtioNetDevice {
    /// Assembles a device from its parts without touching any bus. Most callers want
    /// [`attach_virtio_net`].
    pub fn new(
        config: &VirtioNetConfig,
        emul: Box<dyn RingEmulation>,
        link: Box<dyn GuestLink>,
        dma: Rc<HeapDma>,
    ) -> Self {
        Self {
            bdf: config.bdf,
            iobase: config.iobase,
            emul,
            link,
            dma,
            rx_stats: RxStats::default(),
        }
    }

    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn iobase(&self) -> u16 {
        self.iobase
    }

    pub fn mac(&self) -> MacAddr {
        self.link.mac()
    }

    /// Guest read of `port`, which lies inside the BAR.
    pub fn io_in(&mut self, port: u16, size: u8) -> u32 {
        self.emul.io_in(port.wrapping_sub(self.iobase), size)
    }

    pub fn io_out(&mut self, port: u16, size: u8, value: u32) {
        self.emul.io_out(port.wrapping_sub(self.iobase), size, value);
    }

    /// Moves everything queued on the link into the guest.
    pub fn notify(&mut self) -> RxDrainCounts {
        drain_rx(&mut *self.emul, &mut *self.link, &mut self.rx_stats)
    }

    /// Throws away frames that queued up on the link before the guest could receive them.
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        loop {
            match self.link.poll_receive() {
                RxPoll::None => break,
                RxPoll::More(_) => discarded += 1,
                RxPoll::Last(_) => {
                    discarded += 1;
                    break;
                }
            }
        }
        discarded
    }

    /// Puts the ring emulation back into its power-on state.
    pub fn reset(&mut self) {
        self.emul.io_out(VIRTIO_PCI_LEGACY_STATUS, 1, 0);
    }

    pub fn rx_stats(&self) -> RxStats {
        self.rx_stats
    }

    /// Transmit counters, when the raw interface is a [`VlanRouter`].
    pub fn tx_stats(&self) -> Option<TxStats> {
        self.emul
            .raw()
            .as_any()
            .downcast_ref::<VlanRouter>()
            .map(VlanRouter::stats)
    }

    pub fn dma(&self) -> &HeapDma {
        &self.dma
    }

    pub fn emulation(&self) -> &dyn RingEmulation {
        &*self.emul
    }

    pub fn print_state(&self) {
        tracing::info!(
            bdf = %self.bdf,
            iobase = self.iobase,
            rx_frames = self.rx_stats.frames,
            rx_dropped = self.rx_stats.dropped_no_buffer,
            dma_outstanding = self.dma.outstanding(),
            "virtio-net device state"
        );
        self.emul.raw().print_state();
    }
}

impl std::fmt::Debug for VirtioNetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtioNetDevice")
            .field("bdf", &self.bdf)
            .field("iobase", &self.iobase)
            .field("rx_stats", &self.rx_stats)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a [`VirtioNetDevice`]. The I/O BAR handler and the host each hold one.
#[derive(Clone, Debug)]
pub struct VirtioNetHandle(Rc<RefCell<VirtioNetDevice>>);

impl VirtioNetHandle {
    pub fn new(device: VirtioNetDevice) -> Self {
        Self(Rc::new(RefCell::new(device)))
    }

    pub fn io_in(&self, port: u16, size: u8) -> u32 {
        self.0.borrow_mut().io_in(port, size)
    }

    pub fn io_out(&self, port: u16, size: u8, value: u32) {
        self.0.borrow_mut().io_out(port, size, value);
    }

    /// Runs the receive bridge. Must not be called from inside a port access on the same device.
    pub fn notify(&self) -> RxDrainCounts {
        self.0.borrow_mut().notify()
    }

    pub fn discard_pending(&self) -> usize {
        self.0.borrow_mut().discard_pending()
    }

    pub fn reset(&self) {
        self.0.borrow_mut().reset();
    }

    pub fn device(&self) -> Ref<'_, VirtioNetDevice> {
        self.0.borrow()
    }

    pub fn rx_stats(&self) -> RxStats {
        self.0.borrow().rx_stats()
    }

    pub fn tx_stats(&self) -> Option<TxStats> {
        self.0.borrow().tx_stats()
    }

    pub fn dma_outstanding(&self) -> usize {
        self.0.borrow().dma().outstanding()
    }
}

/// The parts of a guest the device plugs into.
pub struct GuestPlatform {
    pub io: IoPortBus,
    pub pci: Rc<RefCell<PciBus>>,
    pub irq: Rc<RefCell<dyn IrqController>>,
}

impl GuestPlatform {
    /// Empty port and PCI buses wired to `irq`.
    pub fn new(irq: Rc<RefCell<dyn IrqController>>) -> Self {
        Self {
            io: IoPortBus::new(),
            pci: Rc::new(RefCell::new(PciBus::new())),
            irq,
        }
    }
}

/// Host-side collaborators of one device.
pub struct VirtioNetBackend {
    pub mem: Box<dyn GuestMemory>,
    pub fabric: Arc<dyn Fabric>,
    pub link: Box<dyn GuestLink>,
}

/// Finds an already attached virtio-net function on `pci`.
fn existing_virtio_net(pci: &PciBus) -> Option<PciBdf> {
    pci.iter_device_addrs().find(|&bdf| {
        pci.device_config(bdf).is_some_and(|cfg| {
            let ids = cfg.vendor_device_id();
            ids.vendor_id == VIRTIO_NET_VENDOR_ID && ids.device_id == VIRTIO_NET_DEVICE_ID
        })
    })
}

/// Creates the virtio-net device for a guest and wires it into the platform.
///
/// Every precondition is checked before anything is built, so a rejected attach leaves the
/// platform (and any device already attached) untouched. Frames queued on the link before the
/// call are discarded.
pub fn attach_virtio_net(
    platform: &mut GuestPlatform,
    backend: VirtioNetBackend,
    config: &VirtioNetConfig,
) -> Result<VirtioNetHandle, AttachError> {
    config.validate()?;

    if let Some(bdf) = existing_virtio_net(&platform.pci.borrow()) {
        tracing::warn!(%bdf, "virtio-net already attached, rejecting second instance");
        return Err(AttachError::AlreadyAttached(bdf));
    }

    // Validated: the BAR is at most 256 ports.
    let bar_len = config.bar_size() as u16;
    platform.io.is_range_free(config.iobase, bar_len)?;
    platform
        .pci
        .borrow_mut()
        .add_device(config.bdf, Box::new(VirtioNetPciFunction::new(config)))?;

    let VirtioNetBackend { mem, fabric, link } = backend;
    let mac = link.mac();
    let dma = Rc::new(match config.dma_budget {
        Some(bytes) => HeapDma::with_budget(bytes),
        None => HeapDma::new(),
    });
    let router = VlanRouter::new(fabric, mac, config.mtu, platform.irq.clone());
    let emul = LegacyVirtioNet::new(
        mem,
        dma.clone(),
        Box::new(router),
        config.irq_line,
        config.queue_size,
    );
    let handle = VirtioNetHandle::new(VirtioNetDevice::new(config, Box::new(emul), link, dma));

    if let Err(err) = platform.io.try_register_range(
        config.iobase,
        bar_len,
        "virtio-net",
        Box::new(VirtioNetIoBar::new(handle.clone())),
    ) {
        platform.pci.borrow_mut().remove_device(config.bdf);
        return Err(err.into());
    }

    let discarded = handle.discard_pending();
    tracing::info!(
        bdf = %config.bdf,
        iobase = config.iobase,
        irq = config.irq_line,
        %mac,
        discarded,
        "virtio-net attached"
    );
    Ok(handle)
}
