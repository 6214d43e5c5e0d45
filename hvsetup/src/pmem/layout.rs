//! Planning and carving the setup area.
//!
//! Planning is pure: [`plan`] sizes every artifact and places the area
//! under `area_end`. [`RegionPlan::walk`] then replays the placement order
//! on a [`RegionArena`], which both the slot table and the typed layout are
//! built from, so they can never disagree.

use core::mem::{align_of, size_of};

use axerrno::{ax_err, ax_err_type, AxError, AxResult};
use x86_64::structures::paging::PageTable;

use hvaddrspace::paging::{self, PagingRequirement, PagingSkillz, TABLE_SIZE};
use hvaddrspace::{page_align, page_align_next, HostPhysAddr, PhysPtr, RegionArena, PAGE_SIZE};
use svm_vcpu::{GeneralRegisters, VmControl};

use crate::info::{BootInfo, SegmentMemory};
use crate::pool::{pool_desc_size, PoolPageDesc};
use crate::smap::SmapEntry;

/// Alignment of the slots after the monitor image.
const WORD: usize = size_of::<usize>();

const _: () = assert!(align_of::<BootInfo>() <= WORD && align_of::<PoolPageDesc>() <= WORD);

/// Upper bound of [`RegionPlan::slots`] entries.
pub const MAX_SLOTS: usize = 20;

/// What the planner works from.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanInput {
    /// Lowest address the area may start at.
    pub area_floor: usize,
    /// Address the area ends at, rounded down to a page if needed.
    pub area_end: usize,
    /// End of usable RAM, both address spaces map `[0, mem_top)`.
    pub mem_top: usize,
    pub vmm_skillz: PagingSkillz,
    pub vm_skillz: PagingSkillz,
    /// Bytes of monitor stack, a page multiple.
    pub stack_size: usize,
    /// Pages added to the pool on top of the guest paging needs.
    pub pool_extra_pages: usize,
    /// Bytes the monitor image spans once loaded.
    pub vmm_elf_size: usize,
    /// Records of the BIOS memory map.
    pub smap_nr: usize,
}

/// Byte size of every artifact and where the area lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionPlan {
    pub vmm_pg: PagingRequirement,
    pub vm_pg: PagingRequirement,
    pub stack_size: usize,
    pub pool_size: usize,
    pub vmm_pg_size: usize,
    pub vm_pg_size: usize,
    pub vmc_size: usize,
    pub sg_size: usize,
    pub vmm_elf_size: usize,
    pub smap_size: usize,
    pub pool_desc_size: usize,
    pub info_size: usize,
    /// Everything above plus alignment slack, rounded up to a page.
    pub fixed: usize,
    pub start: usize,
    pub end: usize,
}

/// Computes the plan. Nothing is written anywhere.
///
/// Fails with `NoMemory` if the area would start below `area_floor`, or if
/// its size does not even fit in a `usize`.
pub fn plan(input: &PlanInput) -> AxResult<RegionPlan> {
    let (vmm_pg, vm_pg) = paging::predict(input.mem_top, input.vmm_skillz, input.vm_skillz);

    let pool_size = input
        .pool_extra_pages
        .checked_mul(PAGE_SIZE)
        .and_then(|extra| extra.checked_add(vm_pg.vm_pool_size()))
        .ok_or_else(|| too_big(input))?;
    let mut p = RegionPlan {
        vmm_pg,
        vm_pg,
        stack_size: input.stack_size,
        pool_size,
        vmm_pg_size: vmm_pg.vmm_tables_size(),
        vm_pg_size: vm_pg.vm_tables_size(),
        vmc_size: size_of::<VmControl>(),
        sg_size: size_of::<SegmentMemory>(),
        vmm_elf_size: input.vmm_elf_size,
        smap_size: input.smap_nr * SmapEntry::SIZE,
        pool_desc_size: pool_desc_size(pool_size),
        info_size: size_of::<BootInfo>(),
        fixed: 0,
        start: 0,
        end: page_align(input.area_end),
    };

    // one word of slack for each of the image, the pool descriptors and
    // the boot info, which get word aligned
    p.fixed = [
        p.stack_size,
        p.pool_size,
        p.vmm_pg_size,
        p.vm_pg_size,
        p.vmc_size,
        p.sg_size,
        p.vmm_elf_size,
        p.smap_size,
        p.pool_desc_size,
        p.info_size,
        3 * WORD,
    ]
    .iter()
    .try_fold(0usize, |sum, &size| sum.checked_add(size))
    .filter(|&sum| sum <= page_align(usize::MAX))
    .map(page_align_next)
    .ok_or_else(|| too_big(input))?;

    if p.fixed > p.end || p.end - p.fixed < input.area_floor {
        warn!(
            target: "pmem",
            "setup area needs {:#x} bytes, only {:#x} - {:#x} usable",
            p.fixed,
            input.area_floor,
            p.end
        );
        return ax_err!(NoMemory, "not enough memory for setup area");
    }
    p.start = p.end - p.fixed;
    Ok(p)
}

fn too_big(input: &PlanInput) -> AxError {
    warn!(
        target: "pmem",
        "setup area size overflows with {} extra pool pages",
        input.pool_extra_pages
    );
    ax_err_type!(NoMemory, "not enough memory for setup area")
}

/// What a slot of the setup area holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    Stack,
    Pool,
    VmmPml4,
    VmmPdp,
    VmmPd,
    VmPml4,
    VmPdp,
    VmControl,
    SegmentMemory,
    /// Alignment gap, left zeroed.
    Padding,
    VmmImage,
    Smap,
    PoolDesc,
    BootInfo,
    /// Unused tail up to the page boundary.
    Slack,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub kind: SlotKind,
    pub start: usize,
    pub size: usize,
}

impl Slot {
    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

/// Typed handles on the artifacts of a carved area.
#[derive(Clone, Copy, Debug)]
pub struct RegionLayout {
    /// Top of the monitor stack.
    pub stack_bottom: HostPhysAddr,
    /// Guest registers, right below the stack top.
    pub gpr: PhysPtr<GeneralRegisters>,
    pub pool: HostPhysAddr,
    pub vmm_pml4: PhysPtr<PageTable>,
    pub vmm_pdp: PhysPtr<PageTable>,
    /// Null when the host needs no PD.
    pub vmm_pd: PhysPtr<PageTable>,
    pub vm_pml4: PhysPtr<PageTable>,
    pub vm_pdp: PhysPtr<PageTable>,
    pub vmc: PhysPtr<VmControl>,
    pub sg: PhysPtr<SegmentMemory>,
    pub vmm_base: HostPhysAddr,
    pub smap: PhysPtr<SmapEntry>,
    pub pool_desc: PhysPtr<PoolPageDesc>,
    pub info: PhysPtr<BootInfo>,
}

impl RegionPlan {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Assigns every artifact its slot, walking up from `start`, and hands
    /// each one to `visit`. Zero sized artifacts are skipped.
    pub fn walk(&self, mut visit: impl FnMut(Slot)) -> AxResult {
        let mut arena = RegionArena::new(
            HostPhysAddr::from(self.start),
            HostPhysAddr::from(self.end),
        );
        let mut place = |arena: &mut RegionArena, kind: SlotKind, size: usize| -> AxResult {
            let at = arena.take(size)?;
            if size != 0 {
                visit(Slot {
                    kind,
                    start: at.as_usize(),
                    size,
                });
            }
            Ok(())
        };

        place(&mut arena, SlotKind::Stack, self.stack_size)?;
        place(&mut arena, SlotKind::Pool, self.pool_size)?;
        place(&mut arena, SlotKind::VmmPml4, TABLE_SIZE)?;
        place(&mut arena, SlotKind::VmmPdp, self.vmm_pg.pdp * TABLE_SIZE)?;
        place(&mut arena, SlotKind::VmmPd, self.vmm_pg.pd * TABLE_SIZE)?;
        place(&mut arena, SlotKind::VmPml4, TABLE_SIZE)?;
        place(&mut arena, SlotKind::VmPdp, self.vm_pg.pdp * TABLE_SIZE)?;
        place(&mut arena, SlotKind::VmControl, self.vmc_size)?;
        place(&mut arena, SlotKind::SegmentMemory, self.sg_size)?;

        // the image itself needs no alignment, its leading pointer word does
        let gap = arena.gap(WORD);
        place(&mut arena, SlotKind::Padding, gap)?;
        place(&mut arena, SlotKind::VmmImage, self.vmm_elf_size)?;
        place(&mut arena, SlotKind::Smap, self.smap_size)?;

        let gap = arena.gap(WORD);
        place(&mut arena, SlotKind::Padding, gap)?;
        place(&mut arena, SlotKind::PoolDesc, self.pool_desc_size)?;

        let gap = arena.gap(WORD);
        place(&mut arena, SlotKind::Padding, gap)?;
        place(&mut arena, SlotKind::BootInfo, self.info_size)?;

        let slack = arena.remaining();
        place(&mut arena, SlotKind::Slack, slack)
    }

    /// The slot table, in address order. Together the slots tile `[start, end)`.
    pub fn slots(&self) -> AxResult<heapless::Vec<Slot, MAX_SLOTS>> {
        let mut slots = heapless::Vec::new();
        let mut full = false;
        self.walk(|slot| full |= slots.push(slot).is_err())?;
        if full {
            return ax_err!(NoMemory, "slot table full");
        }
        Ok(slots)
    }

    /// Resolves every slot to a typed handle.
    pub fn carve(&self) -> AxResult<RegionLayout> {
        let null = HostPhysAddr::from(0);
        let mut l = RegionLayout {
            stack_bottom: null,
            gpr: PhysPtr::null(),
            pool: null,
            vmm_pml4: PhysPtr::null(),
            vmm_pdp: PhysPtr::null(),
            vmm_pd: PhysPtr::null(),
            vm_pml4: PhysPtr::null(),
            vm_pdp: PhysPtr::null(),
            vmc: PhysPtr::null(),
            sg: PhysPtr::null(),
            vmm_base: null,
            smap: PhysPtr::null(),
            pool_desc: PhysPtr::null(),
            info: PhysPtr::null(),
        };
        self.walk(|slot| {
            let at = HostPhysAddr::from(slot.start);
            match slot.kind {
                SlotKind::Stack => {
                    l.stack_bottom = HostPhysAddr::from(slot.end());
                    l.gpr = PhysPtr::new(l.stack_bottom).sub(1);
                }
                SlotKind::Pool => l.pool = at,
                SlotKind::VmmPml4 => l.vmm_pml4 = PhysPtr::new(at),
                SlotKind::VmmPdp => l.vmm_pdp = PhysPtr::new(at),
                SlotKind::VmmPd => l.vmm_pd = PhysPtr::new(at),
                SlotKind::VmPml4 => l.vm_pml4 = PhysPtr::new(at),
                SlotKind::VmPdp => l.vm_pdp = PhysPtr::new(at),
                SlotKind::VmControl => l.vmc = PhysPtr::new(at),
                SlotKind::SegmentMemory => l.sg = PhysPtr::new(at),
                SlotKind::VmmImage => l.vmm_base = at,
                SlotKind::Smap => l.smap = PhysPtr::new(at),
                SlotKind::PoolDesc => l.pool_desc = PhysPtr::new(at),
                SlotKind::BootInfo => l.info = PhysPtr::new(at),
                SlotKind::Padding | SlotKind::Slack => {}
            }
        })?;
        Ok(l)
    }
}

impl RegionLayout {
    /// Points the descriptors of `info` at their slots.
    pub fn wire(&self, plan: &RegionPlan, info: &mut BootInfo) {
        info.area.start = HostPhysAddr::from(plan.start);
        info.area.end = HostPhysAddr::from(plan.end);
        info.area.size = plan.size();

        let vmm = &mut info.vmm;
        vmm.stack_bottom = self.stack_bottom;
        vmm.pool.addr = self.pool;
        vmm.pool.sz = plan.pool_size;
        vmm.pool.all = self.pool_desc;
        vmm.cpu.pg.pml4 = self.vmm_pml4;
        vmm.cpu.pg.pdp = self.vmm_pdp;
        vmm.cpu.pg.pd = self.vmm_pd;
        vmm.cpu.sg = self.sg;
        vmm.base = self.vmm_base;
        vmm.size = plan.vmm_elf_size;

        let vm = &mut info.vm;
        vm.cpu.pg.pml4 = self.vm_pml4;
        vm.cpu.pg.pdp = self.vm_pdp;
        vm.cpu.vmc = self.vmc;
        vm.cpu.gpr = self.gpr;
        vm.dev.smap.raw = self.smap;
    }
}
