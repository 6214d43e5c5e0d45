//! Physical memory setup.
//!
//! [`pmem_init`] carves the setup area at the top of low memory and fills
//! it, in address order, with:
//!
//! | slot            | content                                        |
//! |-----------------|------------------------------------------------|
//! | stack           | monitor stack, guest registers at its top      |
//! | pool            | pages for guest PDs and PTs                    |
//! | vmm paging      | PML4, PDPs, PDs (only without 1 GiB pages)     |
//! | vm paging       | nested PML4 and PDPs                           |
//! | vmc             | guest and host VMCBs, IOPM, MSRPM              |
//! | segment memory  | monitor GDT, IDT and TSS                       |
//! | vmm image       | relocated monitor, word aligned                |
//! | smap            | copy of the BIOS memory map                    |
//! | pool descriptors| one per pool page                              |
//! | boot info       | the live boot info block                       |

mod layout;

pub use layout::{plan, PlanInput, RegionLayout, RegionPlan, Slot, SlotKind, MAX_SLOTS};

use axerrno::AxError;

use hvaddrspace::{HostPhysAddr, PhysMemIf, PhysPtr, PAGE_SIZE};

use crate::config;
use crate::info::{BootInfo, BootInfoRef};
use crate::mbi::BootLoaderInfo;
use crate::pool::pool_init;
use crate::smap::{smap_init, smap_parse};
use crate::vmm::images::{ElfModule, MonitorImage};

/// Lays out the setup area, loads the monitor into it and moves `info` there.
///
/// The CPU paging skillz of `info` must already be known. Returns the handle
/// on the moved block, the only live one from now on.
///
/// # Panics
///
/// Panics if the boot loader gave no memory map or not exactly two modules,
/// if the monitor image cannot be loaded, or if the area does not fit.
pub fn pmem_init(mem: &impl PhysMemIf, mbi: &BootLoaderInfo, mut info: BootInfo) -> BootInfoRef {
    if let Err(err) = mbi.validate() {
        match err {
            AxError::NotFound => panic!("no bios smap found"),
            _ => panic!("no module found"),
        }
    }

    let smap = match smap_parse(mbi.mmap) {
        Ok(smap) => smap,
        Err(err) => panic!("no bios smap found: {:?}", err),
    };

    let vmm_mod = mbi.vmm_module();
    // SAFETY: modules stay where the boot loader put them, below the setup area
    let image = match ElfModule::parse(unsafe { vmm_mod.bytes(mem) }) {
        Ok(image) => image,
        Err(err) => panic!("failed to load vmm: {:?}", err),
    };

    let mut pool_extra_pages = config::POOL_EXTRA_PAGES;
    if let Some(pages) = config::get_opt(vmm_mod.cmdline, "pool") {
        debug!(target: "pmem", "increasing pool sz by {}*PAGE_SIZE", pages);
        pool_extra_pages = match pool_extra_pages.checked_add(pages as usize) {
            Some(total) => total,
            None => panic!("not enough memory for setup area"),
        };
    }

    info.hrd.mem_top = smap.mem_top;
    let input = PlanInput {
        area_floor: smap.area_floor,
        area_end: smap.area_end,
        mem_top: smap.mem_top,
        vmm_skillz: info.vmm.cpu.skillz,
        vm_skillz: info.vm.cpu.skillz,
        stack_size: config::VMM_MIN_STACK_SIZE,
        pool_extra_pages,
        vmm_elf_size: image.load_size(),
        smap_nr: smap.nr,
    };
    let plan = match plan(&input) {
        Ok(plan) => plan,
        Err(_) => panic!("not enough memory for setup area"),
    };
    let layout = match plan.carve() {
        Ok(layout) => layout,
        Err(err) => panic!("setup area overrun: {:?}", err),
    };

    let start = HostPhysAddr::from(plan.start);
    // SAFETY: the area lies in usable RAM nobody else owns yet
    unsafe { mem.fill(start, 0, plan.size()) };

    layout.wire(&plan, &mut info);
    info.vmm.entry = layout.vmm_base + image.entry();

    // SAFETY: every slot below is inside the zeroed area and sized by the plan
    let info = unsafe {
        if let Err(err) = image.load_relocatable(mem, layout.vmm_base) {
            panic!("failed to load vmm: {:?}", err);
        }
        // the monitor finds its boot info through the first word of its image
        PhysPtr::<u64>::new(layout.vmm_base).write(mem, layout.info.paddr().as_usize() as u64);

        info.vm.dev.smap.nr = smap_init(mem, mbi.mmap, layout.smap.paddr(), plan.start);
        pool_init(mem, &mut info.vmm.pool);

        BootInfoRef::relocate(mem, layout.info, info)
    };

    dump(mem, info);
    info
}

fn dump(mem: &impl PhysMemIf, info: BootInfoRef) {
    // SAFETY: read only, nothing else holds the block during setup
    let info = unsafe { info.get(mem) };
    let area = &info.area;
    let vmm = &info.vmm;
    debug!(target: "pmem", " - area start    = {:#x}", area.start.as_usize());
    debug!(target: "pmem", " - area end      = {:#x}", area.end.as_usize());
    debug!(target: "pmem", " - area size     = {} B ({} KB)", area.size, area.size >> 10);
    debug!(target: "pmem", " - vmm stack     = {:#x}", vmm.stack_bottom.as_usize());
    debug!(
        target: "pmem",
        " - vmm pool      = {:#x} ({} KB)",
        vmm.pool.addr.as_usize(),
        vmm.pool.sz >> 10
    );
    debug!(
        target: "pmem",
        " - vmm elf       = {:#x} - {:#x} ({} B)",
        vmm.base.as_usize(),
        vmm.base.as_usize() + vmm.size,
        vmm.size
    );
    debug!(target: "pmem", " - segment mem   = {:#x}", vmm.cpu.sg);
    debug!(target: "pmem", " - pml4          = {:#x}", vmm.cpu.pg.pml4);
    debug!(target: "pmem", " - vm  vmc       = {:#x}", info.vm.cpu.vmc);
    info!(
        target: "pmem",
        "setup area {:#x} - {:#x}, {} pool pages",
        area.start.as_usize(),
        area.end.as_usize(),
        vmm.pool.sz / PAGE_SIZE
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::vec::Vec;

    use hvaddrspace::paging::PagingSkillz;
    use svm_vcpu::GeneralRegisters;

    use crate::mbi::{BootModule, MbiFlags};
    use crate::pool::POOL_END;
    use crate::smap::tests::mmap;
    use crate::smap::{SmapEntry, SMAP_USABLE};
    use crate::testing::{FakeRam, NoRam};
    use crate::vmm::images::tests::{tiny_pie, TEST_ENTRY, TEST_LOAD_SIZE, TEST_RELOC_AT};

    pub const RAM_BASE: usize = 0x100_0000;
    pub const RAM_SIZE: usize = 0x8_0000;
    /// The setup area goes to the extent above the modules.
    pub const AREA_FLOOR: usize = RAM_BASE + 0x1_0000;

    const VMM_MOD: usize = RAM_BASE;
    const VM_MOD: usize = RAM_BASE + 0x1000;

    /// A machine with 8 MiB of low RAM below the fake window, the window
    /// itself, and a reserved hole.
    pub fn machine_mmap() -> Vec<u8> {
        mmap(&[
            (0, 0x9_f000, SMAP_USABLE),
            (0xf_0000, 0x1_0000, 2),
            (AREA_FLOOR as u64, (RAM_BASE + RAM_SIZE - AREA_FLOOR) as u64, SMAP_USABLE),
        ])
    }

    /// Fake RAM holding the monitor module, and the handoff pointing at it.
    pub fn machine<'a>(ram: &FakeRam, mmap: &'a [u8], vmm_cmdline: &'a str) -> BootLoaderInfo<'a> {
        let elf = tiny_pie(8);
        ram.put(VMM_MOD, &elf);
        ram.put(VM_MOD, &[0xeb, 0xfe]);
        let modules = [
            BootModule {
                start: HostPhysAddr::from(VM_MOD),
                end: HostPhysAddr::from(VM_MOD + 2),
                cmdline: "guest",
            },
            BootModule {
                start: HostPhysAddr::from(VMM_MOD),
                end: HostPhysAddr::from(VMM_MOD + elf.len()),
                cmdline: vmm_cmdline,
            },
        ];
        BootLoaderInfo::new(MbiFlags::MODS | MbiFlags::MMAP, &modules, mmap)
    }

    pub fn cpu_info() -> BootInfo {
        let mut info = BootInfo::new();
        info.vmm.cpu.skillz = PagingSkillz {
            pg_2m: true,
            pg_1g: true,
        };
        info.vm.cpu.skillz = info.vmm.cpu.skillz;
        info
    }

    #[test]
    #[should_panic(expected = "no bios smap found")]
    fn halts_without_memory_map() {
        let modules = [
            BootModule {
                start: HostPhysAddr::from(VM_MOD),
                end: HostPhysAddr::from(VM_MOD + 2),
                cmdline: "",
            },
            BootModule {
                start: HostPhysAddr::from(VMM_MOD),
                end: HostPhysAddr::from(VMM_MOD + 2),
                cmdline: "",
            },
        ];
        let mbi = BootLoaderInfo::new(MbiFlags::MODS, &modules, &[]);
        pmem_init(&NoRam, &mbi, cpu_info());
    }

    #[test]
    #[should_panic(expected = "no module found")]
    fn halts_with_one_module() {
        let raw = machine_mmap();
        let modules = [BootModule {
            start: HostPhysAddr::from(VMM_MOD),
            end: HostPhysAddr::from(VMM_MOD + 2),
            cmdline: "",
        }];
        let mbi = BootLoaderInfo::new(MbiFlags::MODS | MbiFlags::MMAP, &modules, &raw);
        pmem_init(&NoRam, &mbi, cpu_info());
    }

    #[test]
    #[should_panic(expected = "failed to load vmm")]
    fn halts_on_bad_monitor() {
        let ram = FakeRam::new(RAM_BASE, RAM_SIZE);
        let raw = machine_mmap();
        let mbi = machine(&ram, &raw, "vmm");
        ram.put(VMM_MOD, b"MZ");
        pmem_init(&ram, &mbi, cpu_info());
    }

    #[test]
    #[should_panic(expected = "not enough memory for setup area")]
    fn halts_when_area_does_not_fit() {
        let ram = FakeRam::new(RAM_BASE, RAM_SIZE);
        let raw = machine_mmap();
        // a pool larger than the whole extent
        let mbi = machine(&ram, &raw, "vmm pool=4096");
        pmem_init(&ram, &mbi, cpu_info());
    }

    #[test]
    #[should_panic(expected = "not enough memory for setup area")]
    fn halts_on_oversized_pool_option() {
        let ram = FakeRam::new(RAM_BASE, RAM_SIZE);
        let raw = machine_mmap();
        let mbi = machine(&ram, &raw, "vmm pool=4503599627370497");
        pmem_init(&ram, &mbi, cpu_info());
    }

    #[test]
    fn builds_the_setup_area() {
        let ram = FakeRam::new(RAM_BASE, RAM_SIZE);
        let raw = machine_mmap();
        let mbi = machine(&ram, &raw, "/boot/vmm.elf pool=2");

        let info_ref = pmem_init(&ram, &mbi, cpu_info());
        let info = unsafe { info_ref.get(&ram) };

        // the area sits at the top of the window
        assert_eq!(info.area.end.as_usize(), RAM_BASE + RAM_SIZE);
        assert!(info.area.start.as_usize() >= AREA_FLOOR);
        assert_eq!(info.area.start.as_usize() % PAGE_SIZE, 0);
        assert_eq!(
            info.area.start.as_usize() + info.area.size,
            info.area.end.as_usize()
        );
        assert_eq!(info.hrd.mem_top, RAM_BASE + RAM_SIZE);

        // the live block is inside the area, and the monitor knows where
        let slot = info_ref.paddr().as_usize();
        assert!(slot > info.vmm.base.as_usize() && slot < info.area.end.as_usize());
        assert_eq!(ram.read_u64(info.vmm.base.as_usize()), slot as u64);

        // monitor relocated
        let base = info.vmm.base.as_usize();
        assert_eq!(info.vmm.size, TEST_LOAD_SIZE);
        assert_eq!(info.vmm.entry.as_usize(), base + TEST_ENTRY);
        assert_eq!(ram.read_u64(base + TEST_RELOC_AT), (base + TEST_ENTRY) as u64);

        // guest registers right below the stack top, clean
        assert_eq!(
            info.vm.cpu.gpr.paddr().as_usize(),
            info.vmm.stack_bottom.as_usize() - core::mem::size_of::<GeneralRegisters>()
        );
        assert_eq!(unsafe { info.vm.cpu.gpr.as_mut(&ram) }.rax, 0);

        // 2 PD + 2 PT reserved for the guest, 2 more asked on the command line
        let extra = config::POOL_EXTRA_PAGES;
        assert_eq!(info.vmm.pool.pages(), 6 + extra);
        assert_eq!(info.vmm.pool.free, 0);
        let last = unsafe { info.vmm.pool.all.add(5 + extra).as_mut(&ram) };
        assert_eq!(last.next, POOL_END);
        assert_eq!(
            last.addr as usize,
            info.vmm.pool.addr.as_usize() + (5 + extra) * PAGE_SIZE
        );

        // the smap copy hides the area from the guest
        assert_eq!(info.vm.dev.smap.nr, 3);
        let top = unsafe { *info.vm.dev.smap.raw.add(2).as_mut(&ram) };
        assert_eq!({ top.base } as usize, AREA_FLOOR);
        assert_eq!(({ top.base } + { top.len }) as usize, info.area.start.as_usize());
        assert_eq!(core::mem::size_of::<SmapEntry>(), 20);

        // 1 GiB host pages: no host PD
        assert!(info.vmm.cpu.pg.pd().is_none());
        assert_eq!(info.vm.cpu.vmc.paddr().as_usize() % PAGE_SIZE, 0);
    }

    fn all_zero(ram: &FakeRam, from: usize, to: usize) -> bool {
        (from..to).step_by(8).all(|at| ram.read_u64(at) == 0)
    }

    #[test]
    fn area_is_zeroed_before_use() {
        let ram = FakeRam::new(RAM_BASE, RAM_SIZE);
        ram.dirty(0xaa);
        let raw = machine_mmap();
        let mbi = machine(&ram, &raw, "vmm pool=2");

        let info_ref = pmem_init(&ram, &mbi, cpu_info());
        let info = unsafe { info_ref.get(&ram) };
        let start = info.area.start.as_usize();

        // stack, pool pages, paging tables, control blocks and padding
        // are never written during setup
        assert!(all_zero(&ram, start, info.vmm.base.as_usize()));
        let pool = info.vmm.pool.addr.as_usize();
        assert!(all_zero(&ram, pool, pool + info.vmm.pool.sz));
        let vm_pdp = info.vm.cpu.pg.pdp.paddr().as_usize();
        assert!(all_zero(&ram, vm_pdp, vm_pdp + PAGE_SIZE));

        // slack behind the boot info
        let info_end = info_ref.paddr().as_usize() + core::mem::size_of::<BootInfo>();
        assert!(all_zero(&ram, info_end, info.area.end.as_usize()));

        // below the area the stale bytes are untouched
        assert_eq!(ram.read_u64(start - 8), 0xaaaa_aaaa_aaaa_aaaa);
    }

    #[test]
    fn pool_option_adds_pages() {
        let ram = FakeRam::new(RAM_BASE, RAM_SIZE);
        let raw = machine_mmap();

        let plain = machine(&ram, &raw, "vmm");
        let before = unsafe { pmem_init(&ram, &plain, cpu_info()).get(&ram) }.vmm.pool;

        let ram = FakeRam::new(RAM_BASE, RAM_SIZE);
        let grown = machine(&ram, &raw, "vmm pool=16");
        let after = unsafe { pmem_init(&ram, &grown, cpu_info()).get(&ram) }.vmm.pool;

        assert_eq!(after.sz - before.sz, 16 * PAGE_SIZE);
        assert_eq!(after.pages() - before.pages(), 16);
    }
}
