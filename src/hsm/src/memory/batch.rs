// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use hypervisor::{Hypervisor, HypervisorError, MemoryRegion};
use logger::{IncMetric, METRICS};

/// Accumulates region records and flushes them to the hypervisor one
/// hypercall per full batch.
///
/// The capacity is one page's worth of records; the hypervisor reads the
/// batch array straight out of a page-sized buffer.
pub(crate) struct RegionBatch {
    vm_id: u32,
    capacity: usize,
    regions: Vec<MemoryRegion>,
}

impl RegionBatch {
    pub fn new(vm_id: u32) -> RegionBatch {
        let capacity = utils::get_page_size() / std::mem::size_of::<MemoryRegion>();
        Self::with_capacity(vm_id, capacity.max(1))
    }

    fn with_capacity(vm_id: u32, capacity: usize) -> RegionBatch {
        RegionBatch {
            vm_id,
            capacity,
            regions: Vec::with_capacity(capacity),
        }
    }

    /// Appends a record, flushing first the moment the batch fills up.
    pub fn push(
        &mut self,
        hypervisor: &dyn Hypervisor,
        region: MemoryRegion,
    ) -> Result<(), HypervisorError> {
        self.regions.push(region);
        if self.regions.len() == self.capacity {
            return self.flush(hypervisor);
        }
        Ok(())
    }

    /// Sends any buffered records. Called unconditionally at the end of a
    /// mapping request.
    pub fn flush(&mut self, hypervisor: &dyn Hypervisor) -> Result<(), HypervisorError> {
        if self.regions.is_empty() {
            return Ok(());
        }
        hypervisor.set_memory_regions(self.vm_id, &self.regions)?;
        METRICS.memory.region_batches.inc();
        self.regions.clear();
        Ok(())
    }
}
