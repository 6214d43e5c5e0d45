use hvaddrspace::PhysMemIf;
use svm_vcpu::{GuestInit, SvmHal};

use crate::info::BootInfo;

/// The machine setup runs on.
///
/// Besides memory access and the SVM primitives, the platform provides the
/// stages [`crate::init`] runs around memory planning.
pub trait SetupPlatform: PhysMemIf + SvmHal + GuestInit {
    /// Brings the early devices up, the console first.
    fn dev_init(&mut self);

    /// Checks the CPU can run the hypervisor and records the paging
    /// skillz of both address spaces in `info`.
    fn cpu_init(&mut self, info: &mut BootInfo);

    /// Builds the monitor page tables and the guest nested page tables in
    /// the slots `info` points at.
    fn vmem_init(&mut self, info: &mut BootInfo);

    /// Fills the monitor GDT, IDT and TSS and loads them.
    fn intr_init(&mut self, info: &mut BootInfo);
}
