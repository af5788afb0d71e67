// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-side service module bridging a user-space VMM to the hypervisor.
//!
//! The module does two things for a guest VM:
//! * backs the guest RAM with pinned host hugepages and keeps a queryable
//!   GPA to host address index over them ([`memory`]);
//! * turns eventfd signals raised by emulated devices into MSI injections
//!   into the guest, without a syscall round trip per interrupt ([`irqfd`]).
//!
//! The VM lifecycle itself is owned by an external layer: it creates a
//! [`VmHandle`] per guest, serializes teardown against new requests, and
//! finishes a VM with `irqfd().deinit()` followed by
//! `memory().release_all()`.

pub mod irqfd;
pub mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hypervisor::Hypervisor;
use irqfd::IrqfdManager;
use memory::pin::PagePinner;
use memory::{HugepageMap, MemoryManager};

/// Opaque per-guest record the service module attaches its state to.
///
/// Created and destroyed by the external VM lifecycle layer.
pub struct VmHandle {
    vm_id: u32,
    max_gfn: AtomicU64,
    mem: Mutex<HugepageMap>,
}

impl VmHandle {
    pub fn new(vm_id: u32) -> VmHandle {
        VmHandle {
            vm_id,
            max_gfn: AtomicU64::new(0),
            mem: Mutex::new(HugepageMap::new()),
        }
    }

    pub fn vm_id(&self) -> u32 {
        self.vm_id
    }

    /// One past the highest guest frame number covered by a mapping.
    pub fn max_gfn(&self) -> u64 {
        self.max_gfn.load(Ordering::Acquire)
    }

    pub(crate) fn raise_max_gfn(&self, gfn: u64) {
        self.max_gfn.fetch_max(gfn, Ordering::AcqRel);
    }

    pub(crate) fn mem(&self) -> &Mutex<HugepageMap> {
        &self.mem
    }
}

/// The assembled service module: the two managers share one hypervisor
/// connection.
pub struct Hsm {
    memory: MemoryManager,
    irqfd: IrqfdManager,
}

impl Hsm {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, pinner: Arc<dyn PagePinner>) -> Hsm {
        Hsm {
            memory: MemoryManager::new(hypervisor.clone(), pinner),
            irqfd: IrqfdManager::new(hypervisor),
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn irqfd(&self) -> &IrqfdManager {
        &self.irqfd
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::time::{Duration, Instant};

    use hypervisor::{Hypervisor, HypervisorError, MemoryRegion, MsiConfig};

    /// Records every hypercall; lets tests block until an expected number
    /// of MSI injections arrived from the dispatcher thread.
    pub struct FakeHypervisor {
        pub regions: Mutex<Vec<(u32, Vec<MemoryRegion>)>>,
        msis: Mutex<Vec<(u32, MsiConfig)>>,
        msi_cond: Condvar,
        pub fail_regions: AtomicBool,
        pub fail_msi: AtomicBool,
    }

    impl FakeHypervisor {
        pub fn new() -> FakeHypervisor {
            FakeHypervisor {
                regions: Mutex::new(Vec::new()),
                msis: Mutex::new(Vec::new()),
                msi_cond: Condvar::new(),
                fail_regions: AtomicBool::new(false),
                fail_msi: AtomicBool::new(false),
            }
        }

        pub fn msis(&self) -> Vec<(u32, MsiConfig)> {
            self.msis.lock().unwrap().clone()
        }

        /// Waits until at least `count` MSIs were injected or the timeout
        /// elapsed, and returns whatever was recorded.
        pub fn wait_for_msis(&self, count: usize, timeout: Duration) -> Vec<(u32, MsiConfig)> {
            let deadline = Instant::now() + timeout;
            let mut msis = self.msis.lock().unwrap();
            while msis.len() < count {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, res) = self.msi_cond.wait_timeout(msis, deadline - now).unwrap();
                msis = guard;
                if res.timed_out() {
                    break;
                }
            }
            msis.clone()
        }
    }

    impl Hypervisor for FakeHypervisor {
        fn set_memory_regions(
            &self,
            vm_id: u32,
            regions: &[MemoryRegion],
        ) -> Result<(), HypervisorError> {
            if self.fail_regions.load(Ordering::Relaxed) {
                return Err(HypervisorError::SetMemoryRegions);
            }
            self.regions.lock().unwrap().push((vm_id, regions.to_vec()));
            Ok(())
        }

        fn inject_msi(&self, vm_id: u32, msi: &MsiConfig) -> Result<(), HypervisorError> {
            if self.fail_msi.load(Ordering::Relaxed) {
                return Err(HypervisorError::InjectMsi);
            }
            self.msis.lock().unwrap().push((vm_id, *msi));
            self.msi_cond.notify_all();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_handle_max_gfn() {
        let vm = VmHandle::new(7);
        assert_eq!(vm.vm_id(), 7);
        assert_eq!(vm.max_gfn(), 0);
        vm.raise_max_gfn(0x100);
        vm.raise_max_gfn(0x80);
        assert_eq!(vm.max_gfn(), 0x100);
    }
}
