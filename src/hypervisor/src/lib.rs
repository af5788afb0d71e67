// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Narrow interface to the hypervisor's hypercall transport.
//!
//! The service module never talks to the hypervisor directly; everything
//! crosses this trait so the transport (and the hypervisor itself) stays
//! out of scope for the rest of the workspace.

use std::fmt;

use vm_memory::{Address, GuestAddress};

/// Region record operation: establish a GPA to HPA mapping.
pub const REGION_ADD: u32 = 0;
/// Region record operation: remove an existing mapping.
pub const REGION_DEL: u32 = 1;

/// Write-back cacheable memory type tag. Every guest RAM region carries it.
pub const MEM_TYPE_WB: u64 = 0x40;
/// Guest read access.
pub const MEM_ACCESS_READ: u64 = 0x1;
/// Guest write access.
pub const MEM_ACCESS_WRITE: u64 = 0x2;
/// Guest execute access.
pub const MEM_ACCESS_EXEC: u64 = 0x4;
/// Full guest access.
pub const MEM_ACCESS_RWX: u64 = MEM_ACCESS_READ | MEM_ACCESS_WRITE | MEM_ACCESS_EXEC;

/// One entry of a memory-region hypercall batch.
///
/// The hypervisor reads the batch array directly, so the layout is part of
/// the hypercall ABI and must stay `repr(C)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryRegion {
    /// `REGION_ADD` or `REGION_DEL`.
    pub op: u32,
    pub reserved: u32,
    /// Guest-physical base of the region.
    pub gpa: u64,
    /// Host-physical base backing the region.
    pub hpa: u64,
    /// Region length in bytes.
    pub size: u64,
    /// Memory type and access bits (`MEM_TYPE_WB` | `MEM_ACCESS_*`).
    pub attr: u64,
}

impl MemoryRegion {
    pub fn new(op: u32, gpa: GuestAddress, hpa: u64, size: u64, attr: u64) -> Self {
        MemoryRegion {
            op,
            reserved: 0,
            gpa: gpa.raw_value(),
            hpa,
            size,
            attr,
        }
    }
}

/// MSI descriptor: everything the hypervisor needs to inject one interrupt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MsiConfig {
    pub addr: u64,
    pub data: u32,
}

#[derive(Debug)]
pub enum HypervisorError {
    SetMemoryRegions,
    InjectMsi,
}

impl fmt::Display for HypervisorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HypervisorError::SetMemoryRegions => {
                write!(f, "Failed to set guest memory regions")
            }
            HypervisorError::InjectMsi => {
                write!(f, "Failed to inject MSI")
            }
        }
    }
}

/// Trait that abstracts high level hypervisor functionality.
pub trait Hypervisor: Send + Sync {
    /// Applies a batch of guest memory region records to the VM identified
    /// by `vm_id`. The whole batch is carried by a single hypercall.
    fn set_memory_regions(
        &self,
        vm_id: u32,
        regions: &[MemoryRegion],
    ) -> std::result::Result<(), HypervisorError>;

    /// Injects one MSI into the guest identified by `vm_id`.
    fn inject_msi(&self, vm_id: u32, msi: &MsiConfig) -> std::result::Result<(), HypervisorError>;
}
