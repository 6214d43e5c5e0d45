use hvaddrspace::HostPhysAddr;

/// The CPU operations the bring-up sequence depends on.
///
/// [`X86Svm`](crate::X86Svm) drives the real hardware; tests use a recording
/// fake. None of these can fail once CPU detection has confirmed SVM support
/// and that firmware left it unlocked.
pub trait SvmHal {
    /// Points the host state save area MSR (`VM_HSAVE_PA`) at `hsave`, where
    /// VMRUN stores the host state it restores on `#VMEXIT`.
    fn set_host_save_area(&mut self, hsave: HostPhysAddr);

    /// Turns SVM on for the current CPU (`EFER.SVME`). Enabling twice is harmless.
    fn enable(&mut self);

    /// Whether SVM is currently on for this CPU.
    fn is_enabled(&self) -> bool;

    /// Stores the hidden host state (FS, GS, TR, LDTR, syscall MSRs) into the
    /// VMCB at `vmcb`.
    ///
    /// # Safety
    ///
    /// `vmcb` must be the physical address of a 4 KiB aligned VMCB owned by the caller.
    unsafe fn vmsave(&mut self, vmcb: HostPhysAddr);
}
