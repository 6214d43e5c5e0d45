//! The boot info block: everything setup learns and builds, handed over to
//! the monitor.
//!
//! Setup fills a block on its own stack, then moves it into the setup area
//! (see [`crate::pmem::pmem_init`]). From then on only the moved copy is
//! live, reached through a [`BootInfoRef`]. The block is `repr(C)` since
//! the monitor reads it through the pointer word at its image base.

use x86_64::structures::paging::PageTable;
use x86_64::structures::tss::TaskStateSegment;

use hvaddrspace::paging::PagingSkillz;
use hvaddrspace::{HostPhysAddr, PhysMemIf, PhysPtr};
use svm_vcpu::{GeneralRegisters, VmControl};

use crate::pool::PoolDesc;
use crate::smap::SmapEntry;

/// Entries of the monitor GDT.
pub const GDT_ENTRIES: usize = 8;

/// Entries of the monitor IDT.
pub const IDT_ENTRIES: usize = 256;

/// Descriptor tables of the monitor, filled by interrupt setup.
#[repr(C, align(16))]
pub struct SegmentMemory {
    pub gdt: [u64; GDT_ENTRIES],
    /// 64-bit gate descriptors are 16 bytes.
    pub idt: [[u64; 2]; IDT_ENTRIES],
    pub tss: TaskStateSegment,
}

/// The setup area.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BootRegion {
    pub start: HostPhysAddr,
    pub end: HostPhysAddr,
    pub size: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HardwareInfo {
    /// End of the highest usable RAM extent.
    pub mem_top: usize,
}

/// Host paging structures. `pd` is null when the host maps 1 GiB pages.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VmmPaging {
    pub pml4: PhysPtr<PageTable>,
    pub pdp: PhysPtr<PageTable>,
    pub pd: PhysPtr<PageTable>,
}

impl VmmPaging {
    pub fn pd(&self) -> Option<PhysPtr<PageTable>> {
        (!self.pd.is_null()).then_some(self.pd)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VmmCpu {
    pub skillz: PagingSkillz,
    pub pg: VmmPaging,
    pub sg: PhysPtr<SegmentMemory>,
}

/// The host monitor.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VmmDesc {
    /// Load base of the relocated image.
    pub base: HostPhysAddr,
    pub size: usize,
    pub entry: HostPhysAddr,
    /// Top of the monitor stack, the stack grows down from here.
    pub stack_bottom: HostPhysAddr,
    pub pool: PoolDesc,
    pub cpu: VmmCpu,
}

/// Nested paging structures of the guest. Lower levels come from the pool.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VmPaging {
    pub pml4: PhysPtr<PageTable>,
    pub pdp: PhysPtr<PageTable>,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VmCpu {
    pub skillz: PagingSkillz,
    pub pg: VmPaging,
    pub vmc: PhysPtr<VmControl>,
    pub gpr: PhysPtr<GeneralRegisters>,
}

/// Relocated copy of the BIOS memory map.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SmapDesc {
    pub nr: usize,
    pub raw: PhysPtr<SmapEntry>,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VmDev {
    pub smap: SmapDesc,
}

/// The guest.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VmDesc {
    pub cpu: VmCpu,
    pub dev: VmDev,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BootInfo {
    pub area: BootRegion,
    pub hrd: HardwareInfo,
    pub vmm: VmmDesc,
    pub vm: VmDesc,
}

impl BootInfo {
    pub const fn new() -> Self {
        const NULL: HostPhysAddr = HostPhysAddr::from_usize(0);
        Self {
            area: BootRegion {
                start: NULL,
                end: NULL,
                size: 0,
            },
            hrd: HardwareInfo { mem_top: 0 },
            vmm: VmmDesc {
                base: NULL,
                size: 0,
                entry: NULL,
                stack_bottom: NULL,
                pool: PoolDesc::empty(),
                cpu: VmmCpu {
                    skillz: PagingSkillz {
                        pg_2m: false,
                        pg_1g: false,
                    },
                    pg: VmmPaging {
                        pml4: PhysPtr::null(),
                        pdp: PhysPtr::null(),
                        pd: PhysPtr::null(),
                    },
                    sg: PhysPtr::null(),
                },
            },
            vm: VmDesc {
                cpu: VmCpu {
                    skillz: PagingSkillz {
                        pg_2m: false,
                        pg_1g: false,
                    },
                    pg: VmPaging {
                        pml4: PhysPtr::null(),
                        pdp: PhysPtr::null(),
                    },
                    vmc: PhysPtr::null(),
                    gpr: PhysPtr::null(),
                },
                dev: VmDev {
                    smap: SmapDesc {
                        nr: 0,
                        raw: PhysPtr::null(),
                    },
                },
            },
        }
    }
}

impl Default for BootInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle on the live boot info block inside the setup area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootInfoRef(PhysPtr<BootInfo>);

impl BootInfoRef {
    /// Moves `info` to `slot` and returns the handle on the moved block.
    ///
    /// # Safety
    ///
    /// `slot` must be the boot info slot of the setup area.
    pub unsafe fn relocate(mem: &impl PhysMemIf, slot: PhysPtr<BootInfo>, info: BootInfo) -> Self {
        slot.write(mem, info);
        Self(slot)
    }

    pub fn paddr(&self) -> HostPhysAddr {
        self.0.paddr()
    }

    /// Borrows the live block.
    ///
    /// # Safety
    ///
    /// No other borrow of the block may be alive for `'a`.
    pub unsafe fn get<'a>(&self, mem: &impl PhysMemIf) -> &'a mut BootInfo {
        self.0.as_mut(mem)
    }
}
