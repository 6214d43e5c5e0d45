//! Bootstrap stage of a type-1 AMD-V hypervisor.
//!
//! Runs once, right after the boot loader, on a single core with interrupts
//! off. [`init`] plans the physical memory of the host monitor and of its
//! first guest, loads the monitor, and leaves SVM switched on with the guest
//! control block ready for VMRUN.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

pub mod config;
pub mod info;
pub mod logging;
pub mod mbi;
pub mod platform;
pub mod pmem;
pub mod pool;
pub mod smap;
pub mod vmm;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod arch {
            pub mod x86_64;
        }
    }
}

#[cfg(test)]
mod testing;

pub use info::{BootInfo, BootInfoRef};
pub use mbi::BootLoaderInfo;
pub use platform::SetupPlatform;

/// Runs the setup stages in order and returns the handle on the boot info
/// block the monitor will use.
///
/// Every failure is fatal and panics, see [`pmem::pmem_init`].
pub fn init<P: SetupPlatform>(platform: &mut P, mbi: &BootLoaderInfo) -> BootInfoRef {
    platform.dev_init();

    let mut info = BootInfo::new();
    platform.cpu_init(&mut info);

    let info_ref = pmem::pmem_init(&*platform, mbi, info);
    // SAFETY: the block was just moved to the setup area and only setup
    // runs until the monitor starts
    let info = unsafe { info_ref.get(&*platform) };

    platform.vmem_init(info);
    platform.intr_init(info);
    vmm::vmm_init(platform, info);

    info!(
        target: "setup",
        "monitor entry {:#x}, boot info at {:#x}",
        info.vmm.entry.as_usize(),
        info_ref.paddr().as_usize()
    );
    info_ref
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use hvaddrspace::{HostPhysAddr, HostVirtAddr, PhysMemIf};
    use svm_vcpu::{GuestInit, SvmHal, REAL_MODE_ENTRY};

    use super::*;
    use crate::pmem::tests::{cpu_info, machine, machine_mmap, RAM_BASE, RAM_SIZE};
    use crate::testing::FakeRam;

    #[derive(Debug, PartialEq, Eq)]
    enum Stage {
        Dev,
        Cpu,
        Vmem(usize),
        Intr,
        HostSave(usize),
        Enable,
        VmSave(usize),
    }

    struct RecordingPlatform {
        ram: FakeRam,
        stages: Vec<Stage>,
        svm_on: bool,
    }

    impl PhysMemIf for RecordingPlatform {
        fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr {
            self.ram.phys_to_virt(paddr)
        }
    }

    impl SvmHal for RecordingPlatform {
        fn set_host_save_area(&mut self, hsave: HostPhysAddr) {
            self.stages.push(Stage::HostSave(hsave.as_usize()));
        }

        fn enable(&mut self) {
            self.svm_on = true;
            self.stages.push(Stage::Enable);
        }

        fn is_enabled(&self) -> bool {
            self.svm_on
        }

        unsafe fn vmsave(&mut self, vmcb: HostPhysAddr) {
            self.stages.push(Stage::VmSave(vmcb.as_usize()));
        }
    }

    impl GuestInit for RecordingPlatform {}

    impl SetupPlatform for RecordingPlatform {
        fn dev_init(&mut self) {
            self.stages.push(Stage::Dev);
        }

        fn cpu_init(&mut self, info: &mut BootInfo) {
            let cpu = cpu_info();
            info.vmm.cpu.skillz = cpu.vmm.cpu.skillz;
            info.vm.cpu.skillz = cpu.vm.cpu.skillz;
            self.stages.push(Stage::Cpu);
        }

        fn vmem_init(&mut self, info: &mut BootInfo) {
            self.stages.push(Stage::Vmem(info.area.start.as_usize()));
        }

        fn intr_init(&mut self, _info: &mut BootInfo) {
            self.stages.push(Stage::Intr);
        }
    }

    #[test]
    fn stages_run_in_order() {
        let raw = machine_mmap();
        let mut platform = RecordingPlatform {
            ram: FakeRam::new(RAM_BASE, RAM_SIZE),
            stages: Vec::new(),
            svm_on: false,
        };
        let mbi = machine(&platform.ram, &raw, "vmm");

        let info_ref = init(&mut platform, &mbi);
        let info = unsafe { info_ref.get(&platform) };
        let vmc = info.vm.cpu.vmc.paddr().as_usize();

        assert_eq!(
            platform.stages,
            [
                Stage::Dev,
                Stage::Cpu,
                Stage::Vmem(info.area.start.as_usize()),
                Stage::Intr,
                Stage::HostSave(vmc + 0x1000),
                Stage::Enable,
                Stage::VmSave(vmc + 0x1000),
            ]
        );

        let gpr = unsafe { info.vm.cpu.gpr.as_mut(&platform) };
        assert_eq!(gpr.rax, vmc as u64);

        let guest = unsafe { info.vm.cpu.vmc.as_mut(&platform) };
        assert_eq!(guest.vm_vmcb.control.guest_asid, vmm::GUEST_ASID);
        assert_eq!(guest.vm_vmcb.save.rip, REAL_MODE_ENTRY as u64);
        assert_eq!(
            guest.vm_vmcb.control.nested_cr3,
            info.vm.cpu.pg.pml4.paddr().as_usize() as u64
        );
    }
}
