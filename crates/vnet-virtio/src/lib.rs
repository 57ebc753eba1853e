//! Virtio ring emulation for the network device: guest memory access, split virtqueues, the DMA
//! staging contract, the raw network interface contract and the legacy virtio-pci net function.
#![forbid(unsafe_code)]

pub mod dma;
pub mod emulation;
pub mod legacy;
pub mod memory;
pub mod queue;
pub mod raw;

pub use dma::{DmaCacheOp, DmaError, DmaManager, DmaRegion, DMA_ALIGN};
pub use emulation::{RingEmulation, RxBuffer, RxCompletion};
pub use legacy::{LegacyNetStats, LegacyVirtioNet};
pub use memory::{GuestMemory, GuestMemoryError, GuestRam};
pub use queue::{DescriptorChain, VirtQueue, VirtQueueError};
pub use raw::{LinkInfo, RawInterface, TxStatus, UnconfiguredRaw};
