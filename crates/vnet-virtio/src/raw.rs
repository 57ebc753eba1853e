//! The raw network interface the ring emulation drives: frames out, interrupts in.

use core::any::Any;

/// Verdict for one [`RawInterface::raw_tx`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Complete,
    Failed,
}

/// Link parameters reported by [`RawInterface::low_level_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub mac: [u8; 6],
    pub mtu: u32,
}

pub trait RawInterface {
    /// Transmits a batch of complete Ethernet frames.
    fn raw_tx(&mut self, frames: &[&[u8]]) -> TxStatus;

    /// Asserts guest interrupt line `irq` on behalf of the device.
    fn handle_irq(&mut self, irq: u8);

    /// Deasserts `irq` once the guest acknowledged the interrupt.
    fn ack_irq(&mut self, _irq: u8) {}

    fn low_level_init(&mut self) -> LinkInfo;

    /// Dumps interface state to the log.
    fn print_state(&self);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: RawInterface + ?Sized> RawInterface for Box<T> {
    fn raw_tx(&mut self, frames: &[&[u8]]) -> TxStatus {
        <T as RawInterface>::raw_tx(&mut **self, frames)
    }

    fn handle_irq(&mut self, irq: u8) {
        <T as RawInterface>::handle_irq(&mut **self, irq)
    }

    fn ack_irq(&mut self, irq: u8) {
        <T as RawInterface>::ack_irq(&mut **self, irq)
    }

    fn low_level_init(&mut self) -> LinkInfo {
        <T as RawInterface>::low_level_init(&mut **self)
    }

    fn print_state(&self) {
        <T as RawInterface>::print_state(&**self)
    }

    fn as_any(&self) -> &dyn Any {
        <T as RawInterface>::as_any(&**self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        <T as RawInterface>::as_any_mut(&mut **self)
    }
}

/// Placeholder for a device built without a network backend. Any use is a wiring bug.
#[derive(Debug, Default)]
pub struct UnconfiguredRaw;

impl UnconfiguredRaw {
    #[track_caller]
    fn unconfigured(op: &'static str) -> ! {
        tracing::error!(op, "raw network interface used before one was configured");
        panic!("raw network interface not configured ({op})");
    }
}

impl RawInterface for UnconfiguredRaw {
    fn raw_tx(&mut self, _frames: &[&[u8]]) -> TxStatus {
        Self::unconfigured("raw_tx")
    }

    fn handle_irq(&mut self, _irq: u8) {
        Self::unconfigured("handle_irq")
    }

    fn low_level_init(&mut self) -> LinkInfo {
        Self::unconfigured("low_level_init")
    }

    fn print_state(&self) {
        Self::unconfigured("print_state")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
