use crate::{GeneralRegisters, GuestInit, GuestSetup, SvmHal, VmControl};

/// Switches SVM on and prepares the first guest for VMRUN.
///
/// `vmc` is the guest control block living at `setup.vmc`, `gpr` the saved
/// guest registers. In order:
/// 1. point `VM_HSAVE_PA` at the host VMCB of `vmc`,
/// 2. enable SVM,
/// 3. VMSAVE the current host state into the host VMCB,
/// 4. let `hal` initialize the guest VMCB,
/// 5. load the guest VMCB address into the saved guest `rax`, where VMRUN
///    expects it.
///
/// Nothing here can be rolled back, a fault midway leaves the CPU unusable.
pub fn svm_vmm_init<H>(
    hal: &mut H,
    vmc: &mut VmControl,
    gpr: &mut GeneralRegisters,
    setup: &GuestSetup,
) where
    H: SvmHal + GuestInit,
{
    let vmm_vmcb = VmControl::vmm_vmcb_paddr(setup.vmc);
    let vm_vmcb = VmControl::vm_vmcb_paddr(setup.vmc);

    hal.set_host_save_area(vmm_vmcb);
    hal.enable();
    debug!(target: "svm", "svm enabled, host save area {:#x}", vmm_vmcb.as_usize());

    // SAFETY: `setup.vmc` is the control block planned for the guest, nothing
    // else touches it during setup.
    unsafe { hal.vmsave(vmm_vmcb) };

    hal.init_guest(vmc, setup);

    // vmrun needs vmcb addr in rax
    gpr.rax = vm_vmcb.as_usize() as u64;

    info!(target: "svm", "guest vmcb ready at {:#x}", vm_vmcb.as_usize());
}
