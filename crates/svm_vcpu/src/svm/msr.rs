use bit_field::BitField;
use bitflags::bitflags;
use x86::msr::{rdmsr, wrmsr};

/// X86 model-specific registers used by the SVM bring-up. (APM Vol. 2, 15.30)
#[repr(u32)]
#[derive(Debug, Copy, Clone)]
#[allow(non_camel_case_types)]
pub enum Msr {
    VM_CR = 0xc001_0114,
    VM_HSAVE_PA = 0xc001_0117,
}

impl Msr {
    /// Read 64 bits msr register.
    #[inline(always)]
    pub fn read(self) -> u64 {
        unsafe { rdmsr(self as _) }
    }

    /// Write 64 bits to msr register.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write(self, value: u64) {
        wrmsr(self as _, value)
    }
}

pub(super) trait MsrReadWrite {
    const MSR: Msr;

    fn read_raw() -> u64 {
        Self::MSR.read()
    }
}

bitflags! {
    /// VM_CR flags.
    #[derive(Clone, Copy, Debug)]
    pub struct VmCrFlags: u64 {
        const DPD = 1 << 0;
        const R_INIT = 1 << 1;
        const DIS_A20M = 1 << 2;
        /// VM_CR.SVMDIS is read-only once locked.
        const LOCK = 1 << 3;
        /// SVME cannot be set while this is on.
        const SVMDIS = 1 << 4;
    }
}

/// Virtual machine control register.
pub struct VmCr;

impl MsrReadWrite for VmCr {
    const MSR: Msr = Msr::VM_CR;
}

impl VmCr {
    pub fn read() -> VmCrFlags {
        let raw = Self::read_raw();
        VmCrFlags::from_bits_truncate(raw.get_bits(0..5))
    }
}
