//! Paging-structure geometry and the per address space requirement predictor.
//!
//! Both the host monitor and the guest use 4-level long mode paging. Every
//! table is one 4 KiB page holding 512 entries:
//!
//! | level | table | one entry maps |
//! |-------|-------|----------------|
//! | 4     | PML4  | 512 GiB        |
//! | 3     | PDP   | 1 GiB          |
//! | 2     | PD    | 2 MiB          |
//! | 1     | PT    | 4 KiB          |

use core::mem::size_of;

use x86_64::structures::paging::PageTable;

use crate::{PAGE_SIZE, PAGE_SIZE_1G, PAGE_SIZE_2M};

/// Byte size of any paging structure (PML4, PDP, PD or PT).
pub const TABLE_SIZE: usize = size_of::<PageTable>();

/// Number of entries in one paging structure.
pub const TABLE_ENTRIES: usize = TABLE_SIZE / size_of::<u64>();

/// Index of the PDP entry covering `addr`, counted from address 0.
#[inline]
pub const fn pdp_nr(addr: usize) -> usize {
    addr / PAGE_SIZE_1G
}

/// Index of the PD entry covering `addr`, counted from address 0.
#[inline]
pub const fn pd64_nr(addr: usize) -> usize {
    addr / PAGE_SIZE_2M
}

/// Index of the PT entry covering `addr`, counted from address 0.
#[inline]
pub const fn pt64_nr(addr: usize) -> usize {
    addr / PAGE_SIZE
}

/// Large page support of one address space, as discovered by CPU detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PagingSkillz {
    /// 2 MiB pages can be mapped from a PD entry.
    pub pg_2m: bool,
    /// 1 GiB pages can be mapped from a PDP entry.
    pub pg_1g: bool,
}

/// Number of level-3 (PDP), level-2 (PD) and level-1 (PT) tables an address space needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagingRequirement {
    pub pdp: usize,
    pub pd: usize,
    pub pt: usize,
}

/// Number of PDs kept for the guest when it maps memory with 1 GiB pages.
///
/// Covers later fine-grained remaps of a couple of 1 GiB ranges.
pub const VM_PD_RESERVE_1G: usize = 2;

/// Number of PTs kept for the guest when it maps memory with 2 MiB pages.
pub const VM_PT_RESERVE_2M: usize = 2;

/// Predicts the paging structures needed to map `[0, mem_top)` for the host
/// monitor and for the guest.
///
/// The host maps with the largest page size it can and never uses PTs. The
/// guest keeps the same PDP count and reserves lower levels for fine-grained
/// mapping.
///
/// `mem_top` must be non-zero.
pub fn predict(
    mem_top: usize,
    vmm: PagingSkillz,
    vm: PagingSkillz,
) -> (PagingRequirement, PagingRequirement) {
    debug_assert!(mem_top > 0);
    let last = mem_top - 1;

    let pdp = pdp_nr(last) + 1;
    let vmm_pd = if vmm.pg_1g { 0 } else { pd64_nr(last) + 1 };
    let vm_pd = if vm.pg_1g { VM_PD_RESERVE_1G } else { vmm_pd };
    let vm_pt = if vm.pg_2m {
        VM_PT_RESERVE_2M
    } else {
        pt64_nr(last) + 1
    };

    let vmm_req = PagingRequirement {
        pdp,
        pd: vmm_pd,
        pt: 0,
    };
    let vm_req = PagingRequirement {
        pdp,
        pd: vm_pd,
        pt: vm_pt,
    };

    debug!(target: "pmem", "- vmm needs {} pd and {} pt", vmm_req.pd, vmm_req.pt);
    debug!(target: "pmem", "- vm  needs {} pd and {} pt", vm_req.pd, vm_req.pt);

    (vmm_req, vm_req)
}

impl PagingRequirement {
    /// Bytes of the host paging structures: PML4, then every PDP and PD.
    pub const fn vmm_tables_size(&self) -> usize {
        TABLE_SIZE + self.pdp * TABLE_SIZE + self.pd * TABLE_SIZE
    }

    /// Bytes of the guest paging structures allocated up front: PML4 and every PDP.
    pub const fn vm_tables_size(&self) -> usize {
        TABLE_SIZE + self.pdp * TABLE_SIZE
    }

    /// Bytes of the guest paging structures allocated later from the pool.
    pub const fn vm_pool_size(&self) -> usize {
        self.pd * TABLE_SIZE + self.pt * TABLE_SIZE
    }
}
