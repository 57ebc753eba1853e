use std::cell::RefCell;
use std::rc::Rc;

/// Legacy (ISA/PCI INTx) interrupt lines of the guest's interrupt controller.
///
/// Lines are level-triggered: a device raises its line when it has something to report and lowers
/// it once the guest acknowledged the condition (e.g. by reading the virtio ISR register).
pub trait IrqController {
    fn raise_irq(&mut self, irq: u8);
    fn lower_irq(&mut self, irq: u8);
}

/// Records line transitions. Used by tests and by hosts that poll for pending lines.
#[derive(Debug, Default, Clone)]
pub struct IrqLog {
    pub raised: Vec<u8>,
    pub lowered: Vec<u8>,
    asserted: [bool; 16],
}

impl IrqLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `irq` is currently asserted.
    pub fn is_asserted(&self, irq: u8) -> bool {
        self.asserted.get(usize::from(irq)).copied().unwrap_or(false)
    }

    pub fn raise_count(&self, irq: u8) -> usize {
        self.raised.iter().filter(|&&line| line == irq).count()
    }
}

impl IrqController for IrqLog {
    fn raise_irq(&mut self, irq: u8) {
        self.raised.push(irq);
        if let Some(line) = self.asserted.get_mut(usize::from(irq)) {
            *line = true;
        }
    }

    fn lower_irq(&mut self, irq: u8) {
        self.lowered.push(irq);
        if let Some(line) = self.asserted.get_mut(usize::from(irq)) {
            *line = false;
        }
    }
}

impl<T: IrqController + ?Sized> IrqController for Box<T> {
    fn raise_irq(&mut self, irq: u8) {
        <T as IrqController>::raise_irq(&mut **self, irq);
    }

    fn lower_irq(&mut self, irq: u8) {
        <T as IrqController>::lower_irq(&mut **self, irq);
    }
}

impl<T: IrqController + ?Sized> IrqController for Rc<RefCell<T>> {
    fn raise_irq(&mut self, irq: u8) {
        self.borrow_mut().raise_irq(irq);
    }

    fn lower_irq(&mut self, irq: u8) {
        self.borrow_mut().lower_irq(irq);
    }
}
