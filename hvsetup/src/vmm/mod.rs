//! Bringing the monitor and its first guest up.

pub mod images;

use hvaddrspace::PhysMemIf;
use svm_vcpu::{svm_vmm_init, GuestInit, GuestSetup, SvmHal, REAL_MODE_ENTRY};

use crate::info::BootInfo;

/// ASID of the first guest, 0 belongs to the host.
pub const GUEST_ASID: u32 = 1;

/// Switches SVM on and prepares the guest control block planned in `info`.
pub fn vmm_init<P>(platform: &mut P, info: &BootInfo)
where
    P: PhysMemIf + SvmHal + GuestInit,
{
    let cpu = &info.vm.cpu;
    let setup = GuestSetup {
        vmc: cpu.vmc.paddr(),
        npt_root: cpu.pg.pml4.paddr(),
        entry: REAL_MODE_ENTRY,
        asid: GUEST_ASID,
    };
    debug!(
        target: "setup",
        "guest: vmc {:#x}, npt {:#x}, entry {:#x}",
        setup.vmc.as_usize(),
        setup.npt_root.as_usize(),
        setup.entry
    );

    // SAFETY: both live in the setup area, wired by `pmem_init`, and nothing
    // else references them yet
    let (vmc, gpr) = unsafe { (cpu.vmc.as_mut(&*platform), cpu.gpr.as_mut(&*platform)) };
    svm_vmm_init(platform, vmc, gpr, &setup);
}
