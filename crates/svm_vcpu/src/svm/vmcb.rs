//! Virtual machine control block. (AMD64 APM Vol. 2, Appendix B)

use bitflags::bitflags;

bitflags! {
    /// Intercept vector 3, VMCB offset 0x0c.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterceptVector3: u32 {
        const INTR = 1 << 0;
        const NMI = 1 << 1;
        const SMI = 1 << 2;
        const INIT = 1 << 3;
        const VINTR = 1 << 4;
        const CR0_SEL_WRITE = 1 << 5;
        const IDTR_READ = 1 << 6;
        const GDTR_READ = 1 << 7;
        const LDTR_READ = 1 << 8;
        const TR_READ = 1 << 9;
        const IDTR_WRITE = 1 << 10;
        const GDTR_WRITE = 1 << 11;
        const LDTR_WRITE = 1 << 12;
        const TR_WRITE = 1 << 13;
        const RDTSC = 1 << 14;
        const RDPMC = 1 << 15;
        const PUSHF = 1 << 16;
        const POPF = 1 << 17;
        const CPUID = 1 << 18;
        const RSM = 1 << 19;
        const IRET = 1 << 20;
        const INTN = 1 << 21;
        const INVD = 1 << 22;
        const PAUSE = 1 << 23;
        const HLT = 1 << 24;
        const INVLPG = 1 << 25;
        const INVLPGA = 1 << 26;
        /// Consult the I/O permission map.
        const IOIO_PROT = 1 << 27;
        /// Consult the MSR permission map.
        const MSR_PROT = 1 << 28;
        const TASK_SWITCH = 1 << 29;
        const FERR_FREEZE = 1 << 30;
        const SHUTDOWN = 1 << 31;
    }
}

bitflags! {
    /// Intercept vector 4, VMCB offset 0x10.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterceptVector4: u32 {
        /// Must be set, VMRUN fails otherwise.
        const VMRUN = 1 << 0;
        const VMMCALL = 1 << 1;
        const VMLOAD = 1 << 2;
        const VMSAVE = 1 << 3;
        const STGI = 1 << 4;
        const CLGI = 1 << 5;
        const SKINIT = 1 << 6;
        const RDTSCP = 1 << 7;
        const ICEBP = 1 << 8;
        const WBINVD = 1 << 9;
        const MONITOR = 1 << 10;
        const MWAIT = 1 << 11;
        const MWAIT_CONDITIONAL = 1 << 12;
        const XSETBV = 1 << 13;
    }
}

bitflags! {
    /// Nested paging control, VMCB offset 0x90.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NestedControl: u64 {
        const NP_ENABLE = 1 << 0;
        const SEV_ENABLE = 1 << 1;
        const SEV_ES_ENABLE = 1 << 2;
    }
}

/// TLB control values, VMCB offset 0x5c.
pub const TLB_CONTROL_DO_NOTHING: u8 = 0;
pub const TLB_CONTROL_FLUSH_ALL: u8 = 1;

/// Segment attribute encodings used in [`VmcbSegment::attrib`].
pub mod attrib {
    /// Present, DPL 0, code, readable, accessed.
    pub const CODE16: u16 = 0x9b;
    /// Present, DPL 0, data, writable, accessed.
    pub const DATA16: u16 = 0x93;
    /// Present, system, LDT.
    pub const LDT: u16 = 0x82;
    /// Present, system, busy 16-bit TSS.
    pub const TSS16_BUSY: u16 = 0x83;
    /// Present, system, busy 32/64-bit TSS.
    pub const TSS_BUSY: u16 = 0x8b;
}

/// One segment register in the state save area.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmcbSegment {
    pub selector: u16,
    /// Packed attributes: bits 0..8 are descriptor bits 40..48, bits 8..12
    /// are descriptor bits 52..56.
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}

impl VmcbSegment {
    pub const fn new(selector: u16, base: u64, limit: u32, attrib: u16) -> Self {
        Self {
            selector,
            attrib,
            limit,
            base,
        }
    }
}

/// VMCB control area, the first 1 KiB of a VMCB.
#[repr(C)]
pub struct VmcbControlArea {
    /// Bits 0..16 intercept CR reads, bits 16..32 intercept CR writes.
    pub intercept_cr: u32,
    /// Bits 0..16 intercept DR reads, bits 16..32 intercept DR writes.
    pub intercept_dr: u32,
    pub intercept_exceptions: u32,
    pub intercept_vector3: u32,
    pub intercept_vector4: u32,
    pub intercept_vector5: u32,
    _reserved1: [u8; 0x3c - 0x18],
    pub pause_filter_threshold: u16,
    pub pause_filter_count: u16,
    pub iopm_base_pa: u64,
    pub msrpm_base_pa: u64,
    pub tsc_offset: u64,
    pub guest_asid: u32,
    pub tlb_control: u8,
    _reserved2: [u8; 3],
    pub int_control: u64,
    pub int_shadow: u64,
    pub exit_code: u64,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    pub exit_int_info: u64,
    pub nested_control: u64,
    pub avic_apic_bar: u64,
    pub ghcb_pa: u64,
    pub event_inj: u64,
    pub nested_cr3: u64,
    pub virt_ext: u64,
    pub clean_bits: u32,
    _reserved3: u32,
    pub next_rip: u64,
    pub insn_len: u8,
    pub insn_bytes: [u8; 15],
    _reserved4: [u8; 0x400 - 0xe0],
}

/// VMCB state save area, the remaining 3 KiB of a VMCB.
#[repr(C)]
pub struct VmcbStateSaveArea {
    pub es: VmcbSegment,
    pub cs: VmcbSegment,
    pub ss: VmcbSegment,
    pub ds: VmcbSegment,
    pub fs: VmcbSegment,
    pub gs: VmcbSegment,
    pub gdtr: VmcbSegment,
    pub ldtr: VmcbSegment,
    pub idtr: VmcbSegment,
    pub tr: VmcbSegment,
    _reserved1: [u8; 0xcb - 0xa0],
    pub cpl: u8,
    _reserved2: u32,
    pub efer: u64,
    _reserved3: [u8; 0x148 - 0xd8],
    pub cr4: u64,
    pub cr3: u64,
    pub cr0: u64,
    pub dr7: u64,
    pub dr6: u64,
    pub rflags: u64,
    pub rip: u64,
    _reserved4: [u8; 0x1d8 - 0x180],
    pub rsp: u64,
    _reserved5: [u8; 0x1f8 - 0x1e0],
    pub rax: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub cr2: u64,
    _reserved6: [u8; 0x268 - 0x248],
    pub g_pat: u64,
    pub dbgctl: u64,
    pub br_from: u64,
    pub br_to: u64,
    pub last_excp_from: u64,
    pub last_excp_to: u64,
    _reserved7: [u8; 0xc00 - 0x298],
}

/// A 4 KiB, page aligned VMCB.
#[repr(C, align(4096))]
pub struct Vmcb {
    pub control: VmcbControlArea,
    pub save: VmcbStateSaveArea,
}

const _: () = assert!(core::mem::size_of::<VmcbControlArea>() == 0x400);
const _: () = assert!(core::mem::size_of::<VmcbStateSaveArea>() == 0xc00);
const _: () = assert!(core::mem::size_of::<Vmcb>() == 0x1000);

impl VmcbControlArea {
    pub fn intercepts3(&self) -> InterceptVector3 {
        InterceptVector3::from_bits_truncate(self.intercept_vector3)
    }

    pub fn set_intercepts3(&mut self, flags: InterceptVector3) {
        self.intercept_vector3 = flags.bits();
    }

    pub fn intercepts4(&self) -> InterceptVector4 {
        InterceptVector4::from_bits_truncate(self.intercept_vector4)
    }

    pub fn set_intercepts4(&mut self, flags: InterceptVector4) {
        self.intercept_vector4 = flags.bits();
    }
}

impl Vmcb {
    /// Clears the whole block.
    pub fn clear(&mut self) {
        // SAFETY: every field is plain integer data, all-zero is valid.
        unsafe { core::ptr::write_bytes(self as *mut Self as *mut u8, 0, core::mem::size_of::<Self>()) }
    }
}
