pub mod structs;
pub mod vmcb;

#[cfg(target_arch = "x86_64")]
mod instructions;
#[cfg(target_arch = "x86_64")]
mod msr;

#[cfg(target_arch = "x86_64")]
pub use self::x86::{detect_paging_skillz, disabled_by_firmware, has_hardware_support, X86Svm};

#[cfg(target_arch = "x86_64")]
mod x86 {
    use raw_cpuid::CpuId;
    use x86_64::registers::model_specific::{Efer, EferFlags};

    use hvaddrspace::paging::PagingSkillz;
    use hvaddrspace::HostPhysAddr;

    use super::instructions;
    use super::msr::{Msr, VmCr, VmCrFlags};
    use crate::{GuestInit, SvmHal};

    pub fn has_hardware_support() -> bool {
        if let Some(ext) = CpuId::new().get_extended_processor_and_feature_identifiers() {
            ext.has_svm()
        } else {
            false
        }
    }

    /// Whether firmware locked SVM off through `VM_CR.SVMDIS`. Only valid
    /// once [`has_hardware_support`] said yes, VM_CR does not exist otherwise.
    pub fn disabled_by_firmware() -> bool {
        VmCr::read().contains(VmCrFlags::SVMDIS)
    }

    /// Large page support of the host paging unit. Nested paging walks the
    /// same formats, so the guest gets the same answer.
    pub fn detect_paging_skillz() -> PagingSkillz {
        let cpuid = CpuId::new();
        PagingSkillz {
            pg_2m: cpuid
                .get_feature_info()
                .map(|f| f.has_pse())
                .unwrap_or(false),
            pg_1g: cpuid
                .get_extended_processor_and_feature_identifiers()
                .map(|f| f.has_1gib_pages())
                .unwrap_or(false),
        }
    }

    /// [`SvmHal`] for the CPU we are running on.
    #[derive(Debug, Default)]
    pub struct X86Svm;

    impl SvmHal for X86Svm {
        fn set_host_save_area(&mut self, hsave: HostPhysAddr) {
            unsafe { Msr::VM_HSAVE_PA.write(hsave.as_usize() as u64) }
        }

        fn enable(&mut self) {
            if self.is_enabled() {
                return;
            }
            unsafe { Efer::update(|efer| efer.insert(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE)) };
        }

        fn is_enabled(&self) -> bool {
            Efer::read().contains(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE)
        }

        unsafe fn vmsave(&mut self, vmcb: HostPhysAddr) {
            instructions::vmsave(vmcb.as_usize() as u64)
        }
    }

    impl GuestInit for X86Svm {}
}
