use core::arch::asm;

/// Stores the hidden host state into the VMCB at physical address `vmcb`.
#[inline(always)]
pub unsafe fn vmsave(vmcb: u64) {
    asm!("vmsave rax", in("rax") vmcb, options(nostack, preserves_flags));
}

