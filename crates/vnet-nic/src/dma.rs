//! Heap-backed DMA staging allocator.
//!
//! Staging memory is ordinary coherent host memory, so pinning yields the host address and cache
//! maintenance has nothing to do.

use std::cell::Cell;

use vnet_virtio::{DmaCacheOp, DmaError, DmaManager, DmaRegion};

#[derive(Debug, Default)]
pub struct HeapDma {
    budget: Option<usize>,
    outstanding: Cell<usize>,
    outstanding_bytes: Cell<usize>,
    allocations: Cell<u64>,
    failures: Cell<u64>,
}

impl HeapDma {
    /// Unbounded. Only uncached requests and invalid layouts fail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the bytes that may be outstanding at once.
    pub fn with_budget(bytes: usize) -> Self {
        Self {
            budget: Some(bytes),
            ..Self::default()
        }
    }

    /// Regions handed out and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.get()
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.get()
    }

    pub fn failures(&self) -> u64 {
        self.failures.get()
    }

    fn fail(&self, err: DmaError) -> DmaError {
        self.failures.set(self.failures.get() + 1);
        err
    }
}

impl DmaManager for HeapDma {
    fn alloc(&self, size: usize, align: usize, cached: bool) -> Result<DmaRegion, DmaError> {
        if !cached {
            tracing::error!(size, align, "uncached DMA memory requested");
            return Err(self.fail(DmaError::UncachedUnsupported));
        }

        if let Some(budget) = self.budget {
            let available = budget.saturating_sub(self.outstanding_bytes.get());
            if size > available {
                return Err(self.fail(DmaError::Exhausted {
                    requested: size,
                    available,
                }));
            }
        }

        let region = DmaRegion::zeroed(size, align).map_err(|err| self.fail(err))?;
        self.outstanding.set(self.outstanding.get() + 1);
        self.outstanding_bytes
            .set(self.outstanding_bytes.get() + region.len());
        self.allocations.set(self.allocations.get() + 1);
        Ok(region)
    }

    fn free(&self, region: DmaRegion) {
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
        self.outstanding_bytes
            .set(self.outstanding_bytes.get().saturating_sub(region.len()));
    }

    fn pin(&self, region: &DmaRegion) -> u64 {
        region.host_addr()
    }

    fn unpin(&self, _region: &DmaRegion) {}

    fn cache_op(&self, region: &DmaRegion, op: DmaCacheOp) {
        tracing::trace!(?op, len = region.len(), "cache maintenance on coherent memory skipped");
    }
}
