use hvaddrspace::{GuestPhysAddr, HostPhysAddr};

use crate::svm::vmcb::{attrib, InterceptVector3, InterceptVector4, NestedControl, VmcbSegment};
use crate::svm::vmcb::TLB_CONTROL_FLUSH_ALL;
use crate::VmControl;

/// Where a freshly booted PC guest starts: the boot sector load address.
pub const REAL_MODE_ENTRY: GuestPhysAddr = 0x7c00;

const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const EFER_SVME: u64 = 1 << 12;
const RFLAGS_RESERVED: u64 = 1 << 1;
const DR6_INIT: u64 = 0xffff_0ff0;
const DR7_INIT: u64 = 0x400;
/// Power-on value of IA32_PAT.
const PAT_INIT: u64 = 0x0007_0406_0007_0406;

/// What the guest setup needs to know about the memory the setup stage planned for it.
#[derive(Clone, Copy, Debug)]
pub struct GuestSetup {
    /// Physical address of the guest's [`VmControl`].
    pub vmc: HostPhysAddr,
    /// Root of the guest nested page tables.
    pub npt_root: HostPhysAddr,
    /// First instruction the guest executes.
    pub entry: GuestPhysAddr,
    /// Address space identifier of the guest, never 0.
    pub asid: u32,
}

/// Initializes the guest control block before the first VMRUN.
pub trait GuestInit {
    /// Fills `vmc` for the guest described by `setup`.
    ///
    /// The default brings the guest up in real mode, as a PC BIOS would
    /// hand a boot sector over.
    fn init_guest(&mut self, vmc: &mut VmControl, setup: &GuestSetup) {
        init_real_mode(vmc, setup)
    }
}

/// Sets the guest VMCB to the state of a PC right after the boot sector is
/// loaded: real mode, flat 64 KiB segments, nested paging on.
pub fn init_real_mode(vmc: &mut VmControl, setup: &GuestSetup) {
    assert_ne!(setup.asid, 0, "ASID 0 is reserved for the host");

    vmc.iopm.passthrough_all();
    vmc.msrpm.passthrough_all();

    let vmcb = &mut vmc.vm_vmcb;
    vmcb.clear();

    let ctrl = &mut vmcb.control;
    ctrl.set_intercepts3(
        InterceptVector3::SHUTDOWN
            | InterceptVector3::INIT
            | InterceptVector3::IOIO_PROT
            | InterceptVector3::MSR_PROT,
    );
    ctrl.set_intercepts4(InterceptVector4::VMRUN | InterceptVector4::VMMCALL);
    ctrl.iopm_base_pa = VmControl::iopm_paddr(setup.vmc).as_usize() as u64;
    ctrl.msrpm_base_pa = VmControl::msrpm_paddr(setup.vmc).as_usize() as u64;
    ctrl.guest_asid = setup.asid;
    ctrl.tlb_control = TLB_CONTROL_FLUSH_ALL;
    ctrl.nested_control = NestedControl::NP_ENABLE.bits();
    ctrl.nested_cr3 = setup.npt_root.as_usize() as u64;

    let save = &mut vmcb.save;
    let code = VmcbSegment::new(0, 0, 0xffff, attrib::CODE16);
    let data = VmcbSegment::new(0, 0, 0xffff, attrib::DATA16);
    save.cs = code;
    save.ds = data;
    save.es = data;
    save.fs = data;
    save.gs = data;
    save.ss = data;
    save.gdtr = VmcbSegment::new(0, 0, 0xffff, 0);
    save.idtr = VmcbSegment::new(0, 0, 0x3ff, 0);
    save.ldtr = VmcbSegment::new(0, 0, 0xffff, attrib::LDT);
    save.tr = VmcbSegment::new(0, 0, 0xffff, attrib::TSS16_BUSY);
    save.cpl = 0;
    save.efer = EFER_SVME;
    save.cr0 = CR0_ET | CR0_NE;
    save.dr6 = DR6_INIT;
    save.dr7 = DR7_INIT;
    save.rflags = RFLAGS_RESERVED;
    save.rip = setup.entry as u64;
    save.g_pat = PAT_INIT;

    debug!(
        target: "svm",
        "guest vmcb: asid {} ncr3 {:#x} rip {:#x}",
        setup.asid,
        setup.npt_root.as_usize(),
        setup.entry
    );
}
