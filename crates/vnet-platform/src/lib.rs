//! Guest platform plumbing shared by the device models: port-I/O dispatch and legacy interrupt
//! lines.
#![forbid(unsafe_code)]

pub mod interrupts;
pub mod io;

pub use interrupts::{IrqController, IrqLog};
pub use io::{IoPortBus, IoPortError, PortIoDevice};
