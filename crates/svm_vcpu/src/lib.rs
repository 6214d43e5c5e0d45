#![cfg_attr(not(test), no_std)]

//! AMD-V (SVM) support for the hypervisor setup stage.
//!
//! This crate contains:
//! - [`Vmcb`] and [`VmControl`]: the hardware control blocks of one guest, laid
//!   out as the AMD64 manual (Vol. 2, Appendix B) describes them.
//! - [`GeneralRegisters`]: the guest registers VMRUN does not save.
//! - [`SvmHal`]: the narrow interface over the CPU instructions and MSRs used
//!   to switch SVM on.
//! - [`GuestInit`]: the collaborator that fills the guest control block.
//! - [`svm_vmm_init`]: the bring-up sequence tying them together.

#[macro_use]
extern crate log;

mod guest;
mod hal;
mod regs;
mod vmm;

pub mod svm;

pub use guest::{init_real_mode, GuestInit, GuestSetup, REAL_MODE_ENTRY};
pub use hal::SvmHal;
pub use regs::GeneralRegisters;
pub use svm::structs::{IoPermissionMap, MsrPermissionMap, VmControl};
pub use svm::vmcb::{Vmcb, VmcbControlArea, VmcbSegment, VmcbStateSaveArea};
pub use vmm::svm_vmm_init;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use svm::{detect_paging_skillz, disabled_by_firmware, has_hardware_support, X86Svm};
    }
}
