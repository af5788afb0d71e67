// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Page pinning seam.
//!
//! Pinning is an OS primitive the registry calls, not something it
//! implements: the trait keeps that boundary narrow, and [`PinnedPage`]
//! ties the unpin to ownership so it happens exactly once, at VM teardown.

use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

/// Description of one pinned hugepage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PinInfo {
    /// Host-physical base of the page.
    pub hpa: u64,
    /// Address the page is reachable at from the host side.
    pub host_addr: u64,
    /// Backing page size in bytes.
    pub size: u64,
}

/// Pins hugepages out of the VMM's address space.
pub trait PagePinner: Send + Sync {
    /// Pins the page backing `va`. For a hugetlbfs mapping this pins the
    /// whole hugepage; the returned size is the page's actual size.
    fn pin(&self, va: u64) -> io::Result<PinInfo>;

    /// Releases a page pinned by this pinner.
    fn unpin(&self, page: &PinInfo);
}

/// Owned pin on one hugepage; unpins on drop.
pub struct PinnedPage {
    info: PinInfo,
    pinner: Arc<dyn PagePinner>,
}

impl PinnedPage {
    pub fn new(info: PinInfo, pinner: Arc<dyn PagePinner>) -> PinnedPage {
        PinnedPage { info, pinner }
    }

    pub fn hpa(&self) -> u64 {
        self.info.hpa
    }

    pub fn host_addr(&self) -> u64 {
        self.info.host_addr
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.pinner.unpin(&self.info);
    }
}

const PAGEMAP_ENTRY_SIZE: u64 = 8;
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;
const PAGEMAP_PAGE_PRESENT: u64 = 1 << 63;

/// Pinner for mappings living in the calling process: locks the page with
/// `mlock` and resolves its frame number through `/proc/self/pagemap`.
///
/// Reading real frame numbers from pagemap needs `CAP_SYS_ADMIN`.
pub struct MlockPinner;

impl MlockPinner {
    fn frame_number(va: u64) -> io::Result<u64> {
        let mut file = File::open("/proc/self/pagemap")?;
        file.seek(SeekFrom::Start((va >> 12) * PAGEMAP_ENTRY_SIZE))?;
        let mut buf = [0u8; PAGEMAP_ENTRY_SIZE as usize];
        file.read_exact(&mut buf)?;
        let entry = u64::from_le_bytes(buf);
        if entry & PAGEMAP_PAGE_PRESENT == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "page not present after mlock",
            ));
        }
        let pfn = entry & PAGEMAP_PFN_MASK;
        if pfn == 0 {
            // The kernel hides frame numbers from unprivileged readers.
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "pagemap frame numbers unavailable; CAP_SYS_ADMIN required",
            ));
        }
        Ok(pfn)
    }
}

impl PagePinner for MlockPinner {
    fn pin(&self, va: u64) -> io::Result<PinInfo> {
        let smaps = std::fs::read_to_string("/proc/self/smaps")?;
        let size = kernel_page_size(&smaps, va).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no mapping backs the address")
        })?;

        // Safe because we only pass the range of an existing mapping and
        // check the return value.
        let ret = unsafe { libc::mlock(va as *const libc::c_void, size as usize) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        match Self::frame_number(va) {
            Ok(pfn) => Ok(PinInfo {
                hpa: pfn << 12,
                host_addr: va,
                size,
            }),
            Err(e) => {
                // Safe for the same reason as the mlock above.
                unsafe { libc::munlock(va as *const libc::c_void, size as usize) };
                Err(e)
            }
        }
    }

    fn unpin(&self, page: &PinInfo) {
        // Safe because the range was locked by `pin`.
        unsafe { libc::munlock(page.host_addr as *const libc::c_void, page.size as usize) };
    }
}

/// Finds the `KernelPageSize` of the VMA containing `va` in smaps output.
fn kernel_page_size(smaps: &str, va: u64) -> Option<u64> {
    let mut in_vma = false;
    for line in smaps.lines() {
        if let Some(range) = line.split_whitespace().next() {
            if let Some(dash) = range.find('-') {
                let start = u64::from_str_radix(&range[..dash], 16);
                let end = u64::from_str_radix(&range[dash + 1..], 16);
                if let (Ok(start), Ok(end)) = (start, end) {
                    in_vma = va >= start && va < end;
                    continue;
                }
            }
        }
        if in_vma && line.starts_with("KernelPageSize:") {
            let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    const SMAPS: &str = "\
7f0000000000-7f0000200000 rw-p 00000000 00:0f 100        /anon_hugepage (deleted)
Size:               2048 kB
KernelPageSize:     2048 kB
MMUPageSize:        2048 kB
7f0040000000-7f0080000000 rw-p 00000000 00:0f 101        /anon_hugepage (deleted)
Size:            1048576 kB
KernelPageSize:  1048576 kB
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0          [stack]
Size:                132 kB
KernelPageSize:        4 kB
";

    #[test]
    fn test_kernel_page_size() {
        assert_eq!(kernel_page_size(SMAPS, 0x7f00_0000_0000), Some(2 << 20));
        assert_eq!(kernel_page_size(SMAPS, 0x7f00_0010_0000), Some(2 << 20));
        assert_eq!(kernel_page_size(SMAPS, 0x7f00_4000_0000), Some(1 << 30));
        assert_eq!(kernel_page_size(SMAPS, 0x7ffd_0000_0000), Some(4096));
        // One past the end of the first VMA's last page.
        assert_eq!(kernel_page_size(SMAPS, 0x7f00_0020_0000), None);
        assert_eq!(kernel_page_size(SMAPS, 0x1000), None);
    }

    struct CountingPinner(AtomicI64);

    impl PagePinner for CountingPinner {
        fn pin(&self, va: u64) -> io::Result<PinInfo> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(PinInfo {
                hpa: va,
                host_addr: va,
                size: 2 << 20,
            })
        }

        fn unpin(&self, _page: &PinInfo) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_pinned_page_unpins_once_on_drop() {
        let pinner = Arc::new(CountingPinner(AtomicI64::new(0)));
        let info = pinner.pin(0x20_0000).unwrap();
        let page = PinnedPage::new(info, pinner.clone());
        assert_eq!(pinner.0.load(Ordering::SeqCst), 1);
        assert_eq!(page.size(), 2 << 20);
        drop(page);
        assert_eq!(pinner.0.load(Ordering::SeqCst), 0);
    }
}
