// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hugepage-backed guest memory mapping registry.
//!
//! `map_guest` pins the hugepages backing a VMM virtual range, records the
//! GPA to HPA mapping per page and feeds the region hypercall batcher.
//! Later host-side consumers translate guest addresses through `lookup`.
//! Pins are released in one sweep at VM teardown; there is no partial
//! unmap.

pub mod pin;

mod batch;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hypervisor::{Hypervisor, HypervisorError, MemoryRegion, MEM_TYPE_WB, REGION_ADD};
use logger::{info, IncMetric, METRICS};
use vm_memory::{Address, GuestAddress};

use crate::VmHandle;
use batch::RegionBatch;
use pin::{PagePinner, PinnedPage};

/// 2 MiB hugepage size.
pub const HUGEPAGE_2M: u64 = 0x20_0000;
/// 1 GiB hugepage size.
pub const HUGEPAGE_1G: u64 = 0x4000_0000;

const HUGEPAGE_2M_SHIFT: u64 = 21;
const PAGE_SHIFT: u64 = 12;

/// Errors corresponding to guest memory mapping requests.
#[derive(Debug)]
pub enum Error {
    /// Pinning a backing page failed.
    Pin(std::io::Error),
    /// The hypervisor rejected a region batch.
    RegionHypercall(HypervisorError),
    /// The guest address of a 2 MiB page is not 2 MiB aligned.
    UnalignedGpa(u64),
    /// The VMM virtual address is not aligned to the backing page size.
    UnalignedVa(u64),
    /// The backing page is neither a 2 MiB nor a 1 GiB hugepage.
    UnsupportedPageSize(u64),
    /// The request length ends in the middle of a backing page.
    RangeTooShort(u64, u64),
    /// Zero-length mapping request.
    EmptyRange,
    /// The request range wraps around the top of the address space.
    AddressOverflow(u64, u64),
    /// The VM's mappings were already released.
    VmTornDown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match *self {
            Pin(ref err) => write!(f, "Failed to pin backing page: {}", err),
            RegionHypercall(ref err) => write!(f, "Memory region hypercall failed: {}", err),
            UnalignedGpa(gpa) => write!(f, "Guest address {:#x} is not 2 MiB aligned", gpa),
            UnalignedVa(va) => {
                write!(f, "VMM address {:#x} is not aligned to its page size", va)
            }
            UnsupportedPageSize(size) => {
                write!(f, "Backing page size {:#x} is not a supported hugepage size", size)
            }
            RangeTooShort(remaining, page) => write!(
                f,
                "Remaining request length {:#x} is smaller than the {:#x} backing page",
                remaining, page
            ),
            EmptyRange => write!(f, "Empty mapping request"),
            AddressOverflow(base, size) => write!(
                f,
                "Mapping range {:#x}+{:#x} overflows the address space",
                base, size
            ),
            VmTornDown => write!(f, "The VM's mappings were already released"),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// One guest memory mapping request issued by the VMM.
#[derive(Clone, Copy, Debug)]
pub struct MapRequest {
    /// Guest-physical base of the range.
    pub gpa: GuestAddress,
    /// VMM virtual address the range is backed at (hugetlbfs mapping).
    pub vmm_va: u64,
    /// Range length in bytes.
    pub size: u64,
    /// Guest access bits (`MEM_ACCESS_*`); the write-back memory type tag
    /// is added here.
    pub prot: u64,
}

struct HugepageEntry {
    gpa: u64,
    size: u64,
    page: PinnedPage,
}

impl HugepageEntry {
    fn new(gpa: u64, size: u64, page: PinnedPage) -> HugepageEntry {
        HugepageEntry { gpa, size, page }
    }

    fn contains(&self, gpa: u64, size: u64) -> bool {
        match (gpa.checked_add(size), self.gpa.checked_add(self.size)) {
            (Some(end), Some(entry_end)) => gpa >= self.gpa && end <= entry_end,
            _ => false,
        }
    }

    fn translate(&self, gpa: u64) -> u64 {
        self.page.host_addr() + (gpa - self.gpa)
    }
}

/// Per-VM GPA to HPA index over pinned hugepages.
///
/// 1 GiB entries are rare and large, so they live on a flat list searched
/// linearly; everything else sits in a map keyed by the 2 MiB frame number
/// of its base, giving O(1) translation for the common case.
pub struct HugepageMap {
    huge_1g: Vec<HugepageEntry>,
    huge_2m: HashMap<u64, HugepageEntry>,
    sealed: bool,
}

impl HugepageMap {
    pub(crate) fn new() -> HugepageMap {
        HugepageMap {
            huge_1g: Vec::new(),
            huge_2m: HashMap::new(),
            sealed: false,
        }
    }

    fn insert(&mut self, entry: HugepageEntry) {
        if entry.size == HUGEPAGE_1G {
            self.huge_1g.push(entry);
        } else {
            self.huge_2m.insert(entry.gpa >> HUGEPAGE_2M_SHIFT, entry);
        }
    }

    fn find(&self, gpa: u64, size: u64) -> Option<&HugepageEntry> {
        // Giant pages first, then the hashed small entries.
        self.huge_1g
            .iter()
            .find(|e| e.contains(gpa, size))
            .or_else(|| {
                self.huge_2m
                    .get(&(gpa >> HUGEPAGE_2M_SHIFT))
                    .filter(|e| e.contains(gpa, size))
            })
    }

    fn lookup(&self, gpa: u64, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        self.find(gpa, size).map(|e| e.translate(gpa))
    }

    fn contains(&self, gpa: u64) -> bool {
        self.find(gpa, 1).is_some()
    }

    fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Marks the map torn down and drops every entry, unpinning its page.
    fn seal_and_drain(&mut self) -> usize {
        self.sealed = true;
        let released = self.huge_1g.len() + self.huge_2m.len();
        self.huge_1g.clear();
        self.huge_2m.clear();
        released
    }

    #[cfg(test)]
    fn len(&self) -> (usize, usize) {
        (self.huge_1g.len(), self.huge_2m.len())
    }
}

/// Maintains the per-VM hugepage registries and drives the mapping
/// hypercalls.
pub struct MemoryManager {
    hypervisor: Arc<dyn Hypervisor>,
    pinner: Arc<dyn PagePinner>,
}

impl MemoryManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, pinner: Arc<dyn PagePinner>) -> MemoryManager {
        MemoryManager { hypervisor, pinner }
    }

    /// Establishes guest RAM mappings over the hugepages backing
    /// `req.vmm_va .. req.vmm_va + req.size`.
    ///
    /// The walk is one hugepage at a time; 2 MiB and 1 GiB pages may mix
    /// within one request. On failure the error is propagated and pages
    /// already pinned by this call stay pinned and mapped; they are
    /// reclaimed at VM teardown. Partial failure here happens during guest
    /// boot and is fatal to the VM regardless.
    pub fn map_guest(&self, vm: &VmHandle, req: &MapRequest) -> Result<()> {
        let res = self.do_map(vm, req);
        match res {
            Ok(()) => METRICS.memory.map_requests.inc(),
            Err(_) => METRICS.memory.map_fails.inc(),
        }
        res
    }

    fn do_map(&self, vm: &VmHandle, req: &MapRequest) -> Result<()> {
        if req.size == 0 {
            return Err(Error::EmptyRange);
        }
        // The page walk advances two cursors by the page size; both ends
        // must exist before the walk starts.
        if req.gpa.raw_value().checked_add(req.size).is_none() {
            return Err(Error::AddressOverflow(req.gpa.raw_value(), req.size));
        }
        if req.vmm_va.checked_add(req.size).is_none() {
            return Err(Error::AddressOverflow(req.vmm_va, req.size));
        }
        let attr = req.prot | MEM_TYPE_WB;

        // One mutex per VM guards both containers for the whole request.
        let mut map = vm.mem().lock().unwrap();
        if map.is_sealed() {
            return Err(Error::VmTornDown);
        }

        let mut batch = RegionBatch::new(vm.vm_id());
        let mut gpa = req.gpa.raw_value();
        let mut va = req.vmm_va;
        let mut remaining = req.size;

        while remaining > 0 {
            let info = self.pinner.pin(va).map_err(Error::Pin)?;
            let page = PinnedPage::new(info, self.pinner.clone());
            let size = page.size();

            if size != HUGEPAGE_2M && size != HUGEPAGE_1G {
                return Err(Error::UnsupportedPageSize(size));
            }
            if va % size != 0 {
                return Err(Error::UnalignedVa(va));
            }
            if size == HUGEPAGE_2M && gpa % HUGEPAGE_2M != 0 {
                // The 2 MiB index is keyed by frame number and needs
                // aligned bases; 1 GiB entries carry explicit ranges.
                return Err(Error::UnalignedGpa(gpa));
            }
            if remaining < size {
                return Err(Error::RangeTooShort(remaining, size));
            }

            let hpa = page.hpa();
            // The entry owns the pin from here on, even if a later step of
            // this request fails.
            map.insert(HugepageEntry::new(gpa, size, page));
            METRICS.memory.pages_pinned.inc();

            batch
                .push(
                    self.hypervisor.as_ref(),
                    MemoryRegion::new(REGION_ADD, GuestAddress(gpa), hpa, size, attr),
                )
                .map_err(Error::RegionHypercall)?;

            gpa += size;
            va += size;
            remaining -= size;
        }

        batch
            .flush(self.hypervisor.as_ref())
            .map_err(Error::RegionHypercall)?;

        vm.raise_max_gfn(gpa >> PAGE_SHIFT);
        info!(
            "VM {}: mapped {:#x} bytes of guest RAM at GPA {:#x}",
            vm.vm_id(),
            req.size,
            req.gpa.raw_value()
        );
        Ok(())
    }

    /// Translates a guest range to a host address.
    ///
    /// The range must be fully contained in a single mapped hugepage;
    /// partial overlap is a caller error and reported as not found, never
    /// silently truncated.
    pub fn lookup(&self, vm: &VmHandle, gpa: GuestAddress, size: u64) -> Option<u64> {
        vm.mem().lock().unwrap().lookup(gpa.raw_value(), size)
    }

    /// Whether `gpa` falls inside any established mapping.
    pub fn contains(&self, vm: &VmHandle, gpa: GuestAddress) -> bool {
        vm.mem().lock().unwrap().contains(gpa.raw_value())
    }

    /// Releases every pin and entry of the VM, once, at teardown.
    ///
    /// The VM lifecycle layer must already have stopped new mapping
    /// requests; any `map_guest` arriving after this fails with
    /// [`Error::VmTornDown`].
    pub fn release_all(&self, vm: &VmHandle) {
        let released = vm.mem().lock().unwrap().seal_and_drain();
        info!(
            "VM {}: released {} hugepage mappings",
            vm.vm_id(),
            released
        );
    }
}
