//! Boot loader handoff: the multiboot information block.

use core::ffi::CStr;

use axerrno::{ax_err, AxResult};
use bitflags::bitflags;

use hvaddrspace::{HostPhysAddr, PhysMemIf, PhysPtr};

/// Modules we keep track of; setup needs exactly two.
pub const MAX_MODULES: usize = 4;

/// Number of modules the boot loader must hand over: the guest payload and
/// the monitor image.
pub const EXPECTED_MODULES: usize = 2;

/// Index of the guest payload module.
pub const VM_MODULE: usize = 0;

/// Index of the monitor image module.
pub const VMM_MODULE: usize = 1;

bitflags! {
    /// Multiboot information flags: which fields the boot loader filled.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MbiFlags: u32 {
        const MEM = 1 << 0;
        const BOOT_DEVICE = 1 << 1;
        const CMDLINE = 1 << 2;
        const MODS = 1 << 3;
        const AOUT_SYMS = 1 << 4;
        const ELF_SHDR = 1 << 5;
        const MMAP = 1 << 6;
    }
}

/// Multiboot information block as the boot loader lays it out.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawMbi {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
}

/// Multiboot module descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawModule {
    mod_start: u32,
    mod_end: u32,
    string: u32,
    reserved: u32,
}

/// A module loaded by the boot loader.
#[derive(Debug, Clone, Copy)]
pub struct BootModule<'a> {
    pub start: HostPhysAddr,
    pub end: HostPhysAddr,
    /// Module command line, options are `key=value` words.
    pub cmdline: &'a str,
}

impl<'a> BootModule<'a> {
    pub fn size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    /// The module contents.
    ///
    /// # Safety
    ///
    /// `[start, end)` must be memory the boot loader filled and nobody writes to.
    pub unsafe fn bytes<'b>(&self, mem: &impl PhysMemIf) -> &'b [u8] {
        core::slice::from_raw_parts(
            mem.phys_to_virt(self.start).as_ptr(),
            self.size(),
        )
    }
}

/// What setup needs from the multiboot handoff.
#[derive(Debug, Clone)]
pub struct BootLoaderInfo<'a> {
    pub flags: MbiFlags,
    /// Module count as reported, may exceed what `modules` holds.
    pub mods_count: usize,
    pub modules: heapless::Vec<BootModule<'a>, MAX_MODULES>,
    /// Raw multiboot memory map, empty if `flags` lacks [`MbiFlags::MMAP`].
    pub mmap: &'a [u8],
}

impl<'a> BootLoaderInfo<'a> {
    pub fn new(flags: MbiFlags, modules: &[BootModule<'a>], mmap: &'a [u8]) -> Self {
        let mods_count = modules.len();
        Self {
            flags,
            mods_count,
            modules: modules.iter().take(MAX_MODULES).copied().collect(),
            mmap,
        }
    }

    /// Builds the view from the multiboot information block at `mbi`.
    ///
    /// # Safety
    ///
    /// `mbi` must point to a valid multiboot information block, and all the
    /// memory it references must stay untouched for `'a`.
    pub unsafe fn from_raw(mem: &impl PhysMemIf, mbi: HostPhysAddr) -> Self {
        let raw: RawMbi = *PhysPtr::<RawMbi>::new(mbi).as_mut(mem);
        let flags = MbiFlags::from_bits_truncate(raw.flags);

        let mut modules = heapless::Vec::new();
        if flags.contains(MbiFlags::MODS) {
            let table = PhysPtr::<RawModule>::new(HostPhysAddr::from(raw.mods_addr as usize));
            for i in 0..(raw.mods_count as usize).min(MAX_MODULES) {
                let m: RawModule = *table.add(i).as_mut(mem);
                let cmdline = if m.string == 0 {
                    ""
                } else {
                    let p = mem.phys_to_virt(HostPhysAddr::from(m.string as usize));
                    match CStr::from_ptr(p.as_ptr() as *const _).to_str() {
                        Ok(cmdline) => cmdline,
                        Err(_) => {
                            warn!(target: "setup", "module {} command line is not utf-8, ignored", i);
                            ""
                        }
                    }
                };
                let _ = modules.push(BootModule {
                    start: HostPhysAddr::from(m.mod_start as usize),
                    end: HostPhysAddr::from(m.mod_end as usize),
                    cmdline,
                });
            }
        }

        let mmap: &[u8] = if flags.contains(MbiFlags::MMAP) && raw.mmap_length != 0 {
            let p = mem.phys_to_virt(HostPhysAddr::from(raw.mmap_addr as usize));
            core::slice::from_raw_parts(p.as_ptr(), raw.mmap_length as usize)
        } else {
            &[]
        };

        Self {
            flags,
            mods_count: if flags.contains(MbiFlags::MODS) {
                raw.mods_count as usize
            } else {
                0
            },
            modules,
            mmap,
        }
    }

    /// Checks the boot environment setup cannot run without.
    pub fn validate(&self) -> AxResult {
        if !self.flags.contains(MbiFlags::MMAP) {
            return ax_err!(NotFound, "no bios smap found");
        }
        if self.mods_count != EXPECTED_MODULES || self.modules.len() != EXPECTED_MODULES {
            return ax_err!(InvalidInput, "no module found");
        }
        Ok(())
    }

    /// The monitor image module. Only meaningful after [`Self::validate`].
    pub fn vmm_module(&self) -> &BootModule<'a> {
        &self.modules[VMM_MODULE]
    }

    /// The guest payload module. Only meaningful after [`Self::validate`].
    pub fn vm_module(&self) -> &BootModule<'a> {
        &self.modules[VM_MODULE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    fn module(cmdline: &str) -> BootModule<'_> {
        BootModule {
            start: HostPhysAddr::from(0x10_0000),
            end: HostPhysAddr::from(0x10_0400),
            cmdline,
        }
    }

    #[test]
    fn needs_memory_map() {
        let mods = [module("guest"), module("vmm")];
        let mbi = BootLoaderInfo::new(MbiFlags::MODS, &mods, &[]);
        assert_eq!(mbi.validate(), Err(AxError::NotFound));
    }

    #[test]
    fn needs_two_modules() {
        let one = [module("vmm")];
        let mbi = BootLoaderInfo::new(MbiFlags::MODS | MbiFlags::MMAP, &one, &[]);
        assert_eq!(mbi.validate(), Err(AxError::InvalidInput));

        let three = [module("a"), module("b"), module("c")];
        let mbi = BootLoaderInfo::new(MbiFlags::MODS | MbiFlags::MMAP, &three, &[]);
        assert_eq!(mbi.validate(), Err(AxError::InvalidInput));

        let two = [module("guest"), module("vmm pool=2")];
        let mbi = BootLoaderInfo::new(MbiFlags::MODS | MbiFlags::MMAP, &two, &[]);
        assert_eq!(mbi.validate(), Ok(()));
        assert_eq!(mbi.vmm_module().cmdline, "vmm pool=2");
        assert_eq!(mbi.vm_module().size(), 0x400);
    }

    #[test]
    fn parses_raw_block() {
        use std::vec::Vec;

        // the block only holds 32-bit pointers, so treat them as offsets
        // into a host buffer
        struct Window(usize);
        impl PhysMemIf for Window {
            fn phys_to_virt(&self, paddr: HostPhysAddr) -> hvaddrspace::HostVirtAddr {
                hvaddrspace::HostVirtAddr::from(self.0 + paddr.as_usize())
            }
        }

        let mut backing = std::vec![0u64; 0x200];
        let base = backing.as_mut_ptr() as usize;
        let low = unsafe { core::slice::from_raw_parts_mut(base as *mut u8, 0x1000) };
        let mut put = |at: usize, bytes: &[u8]| low[at..at + bytes.len()].copy_from_slice(bytes);
        let u32s = |vals: &[u32]| -> Vec<u8> { vals.iter().flat_map(|v| v.to_le_bytes()).collect() };

        // mbi at 0, modules at 0x100, strings at 0x200, mmap at 0x300
        let mut mbi = [0u32; 13];
        mbi[0] = (MbiFlags::MODS | MbiFlags::MMAP).bits();
        mbi[5] = 2;
        mbi[6] = 0x100;
        mbi[11] = 24;
        mbi[12] = 0x300;
        put(0, &u32s(&mbi));
        put(0x100, &u32s(&[0x8000, 0x8200, 0x200, 0, 0x9000, 0x9800, 0x210, 0]));
        put(0x200, b"guest\0");
        put(0x210, b"vmm pool=3\0");

        let info = unsafe { BootLoaderInfo::from_raw(&Window(base), HostPhysAddr::from(0)) };
        assert_eq!(info.mods_count, 2);
        assert_eq!(info.modules[0].cmdline, "guest");
        assert_eq!(info.vmm_module().cmdline, "vmm pool=3");
        assert_eq!(info.vmm_module().size(), 0x800);
        assert_eq!(info.mmap.len(), 24);
        assert_eq!(info.mmap.as_ptr() as usize, base + 0x300);
        assert!(info.validate().is_ok());

        // a command line that is not utf-8 reads as empty
        put(0x200, b"gu\xffest\0");
        let info = unsafe { BootLoaderInfo::from_raw(&Window(base), HostPhysAddr::from(0)) };
        assert_eq!(info.vm_module().cmdline, "");
        assert_eq!(info.vmm_module().cmdline, "vmm pool=3");
        drop(backing);
    }
}
