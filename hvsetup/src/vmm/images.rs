//! Loading the monitor image.
//!
//! The monitor is a position independent ELF64 executable linked at 0. It
//! is copied segment by segment to its slot in the setup area, then its
//! `R_X86_64_RELATIVE` relocations are applied against the load base.

use axerrno::{ax_err, ax_err_type, AxResult};
use elf_rs::{Elf, ElfFile, ProgramType};

use hvaddrspace::{HostPhysAddr, PhysMemIf};

const DT_NULL: u64 = 0;
const DT_RELA: u64 = 7;
const DT_RELASZ: u64 = 8;
const DT_RELAENT: u64 = 9;
const DT_REL: u64 = 17;

const R_X86_64_NONE: u32 = 0;
const R_X86_64_RELATIVE: u32 = 8;

const RELA_SIZE: usize = 24;

/// A monitor image that can be loaded anywhere.
pub trait MonitorImage {
    /// Bytes the image spans once loaded, including zero-filled parts.
    fn load_size(&self) -> usize;

    /// Entry point, relative to the load base.
    fn entry(&self) -> usize;

    /// Copies the image to `base` and fixes it up for that address.
    ///
    /// # Safety
    ///
    /// `[base, base + self.load_size())` must be zeroed memory owned by the caller.
    unsafe fn load_relocatable(&self, mem: &impl PhysMemIf, base: HostPhysAddr) -> AxResult;
}

/// A boot module holding an ELF64 executable.
pub struct ElfModule<'a> {
    data: &'a [u8],
    elf: Elf<'a>,
    load_size: usize,
}

fn le_u64(data: &[u8], at: usize) -> AxResult<u64> {
    let bytes = data
        .get(at..at + 8)
        .ok_or_else(|| ax_err_type!(InvalidData, "elf: read past end of file"))?;
    let mut w = [0; 8];
    w.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(w))
}

impl<'a> ElfModule<'a> {
    /// Checks `data` is a loadable ELF64 image linked at address 0.
    pub fn parse(data: &'a [u8]) -> AxResult<Self> {
        let elf = Elf::from_bytes(data)
            .map_err(|_| ax_err_type!(InvalidData, "elf: bad header"))?;
        if !matches!(elf, Elf::Elf64(_)) {
            return ax_err!(Unsupported, "elf: not a 64-bit image");
        }

        let mut low = u64::MAX;
        let mut high = 0;
        for ph in elf.program_header_iter() {
            if ph.ph_type() != ProgramType::LOAD || ph.memsz() == 0 {
                continue;
            }
            if ph.filesz() > ph.memsz()
                || ph.offset().saturating_add(ph.filesz()) > data.len() as u64
            {
                return ax_err!(InvalidData, "elf: segment out of file bounds");
            }
            low = low.min(ph.vaddr());
            high = high.max(ph.vaddr().saturating_add(ph.memsz()));
        }
        if high == 0 {
            return ax_err!(InvalidData, "elf: no loadable segment");
        }
        if low != 0 {
            warn!(target: "elf", "image linked at {:#x}, not relocatable", low);
            return ax_err!(Unsupported, "elf: image not linked at 0");
        }

        Ok(Self {
            data,
            elf,
            load_size: high as usize,
        })
    }

    /// File offset of the image byte at `vaddr`.
    fn file_offset(&self, vaddr: u64) -> AxResult<usize> {
        self.elf
            .program_header_iter()
            .filter(|ph| ph.ph_type() == ProgramType::LOAD)
            .find(|ph| ph.vaddr() <= vaddr && vaddr < ph.vaddr() + ph.filesz())
            .map(|ph| (ph.offset() + (vaddr - ph.vaddr())) as usize)
            .ok_or_else(|| ax_err_type!(InvalidData, "elf: address outside file data"))
    }

    /// Finds the RELA table through the dynamic segment, as `(file offset, count)`.
    fn rela_table(&self) -> AxResult<Option<(usize, usize)>> {
        let Some(dynamic) = self
            .elf
            .program_header_iter()
            .find(|ph| ph.ph_type() == ProgramType::DYNAMIC)
        else {
            return Ok(None);
        };

        let (mut rela, mut relasz, mut relaent) = (None, 0, RELA_SIZE as u64);
        let start = dynamic.offset() as usize;
        let end = start + dynamic.filesz() as usize;
        for at in (start..end).step_by(16) {
            let tag = le_u64(self.data, at)?;
            let val = le_u64(self.data, at + 8)?;
            match tag {
                DT_NULL => break,
                DT_RELA => rela = Some(val),
                DT_RELASZ => relasz = val,
                DT_RELAENT => relaent = val,
                DT_REL => return ax_err!(Unsupported, "elf: REL relocations"),
                _ => {}
            }
        }

        match rela {
            Some(_) if relaent != RELA_SIZE as u64 => {
                ax_err!(InvalidData, "elf: unexpected RELA entry size")
            }
            Some(vaddr) => Ok(Some((self.file_offset(vaddr)?, relasz as usize / RELA_SIZE))),
            None => Ok(None),
        }
    }
}

impl MonitorImage for ElfModule<'_> {
    fn load_size(&self) -> usize {
        self.load_size
    }

    fn entry(&self) -> usize {
        self.elf.elf_header().entry_point() as usize
    }

    unsafe fn load_relocatable(&self, mem: &impl PhysMemIf, base: HostPhysAddr) -> AxResult {
        for ph in self.elf.program_header_iter() {
            if ph.ph_type() != ProgramType::LOAD || ph.memsz() == 0 {
                continue;
            }
            let offset = ph.offset() as usize;
            let filesz = ph.filesz() as usize;
            let dst = base + ph.vaddr() as usize;
            trace!(
                target: "elf",
                "segment {:#x} + {:#x} -> {:#x}",
                ph.vaddr(),
                ph.memsz(),
                dst.as_usize()
            );
            mem.copy_to(dst, &self.data[offset..offset + filesz]);
            mem.fill(dst + filesz, 0, ph.memsz() as usize - filesz);
        }

        let Some((table, count)) = self.rela_table()? else {
            debug!(target: "elf", "no dynamic relocations");
            return Ok(());
        };
        for i in 0..count {
            let at = table + i * RELA_SIZE;
            let r_offset = le_u64(self.data, at)?;
            let r_info = le_u64(self.data, at + 8)?;
            let r_addend = le_u64(self.data, at + 16)?;
            match r_info as u32 {
                R_X86_64_NONE => {}
                R_X86_64_RELATIVE => {
                    if r_offset + 8 > self.load_size as u64 {
                        return ax_err!(InvalidData, "elf: relocation out of image");
                    }
                    let value = (base.as_usize() as u64).wrapping_add(r_addend);
                    mem.copy_to(base + r_offset as usize, &value.to_le_bytes());
                }
                other => {
                    warn!(target: "elf", "relocation type {} at {:#x}", other, r_offset);
                    return ax_err!(Unsupported, "elf: unsupported relocation type");
                }
            }
        }
        debug!(target: "elf", "{} relocations applied at {:#x}", count, base.as_usize());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::vec::Vec;

    pub const TEST_ENTRY: usize = 0x100;
    pub const TEST_LOAD_SIZE: usize = 0x1000;
    pub const TEST_RELOC_AT: usize = 0x1f0;

    fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// A minimal PIE: one RWX load segment, a dynamic segment and a single
    /// relative relocation of the word at `TEST_RELOC_AT` to `base + TEST_ENTRY`.
    pub fn tiny_pie(reloc_type: u64) -> Vec<u8> {
        let mut f = std::vec![0u8; 0x200];
        put(&mut f, 0, &[0x7f, b'E', b'L', b'F', 2, 1, 1]);
        put(&mut f, 16, &3u16.to_le_bytes()); // ET_DYN
        put(&mut f, 18, &0x3eu16.to_le_bytes()); // x86_64
        put(&mut f, 20, &1u32.to_le_bytes());
        put(&mut f, 24, &(TEST_ENTRY as u64).to_le_bytes());
        put(&mut f, 32, &64u64.to_le_bytes()); // e_phoff
        put(&mut f, 52, &64u16.to_le_bytes()); // e_ehsize
        put(&mut f, 54, &56u16.to_le_bytes()); // e_phentsize
        put(&mut f, 56, &2u16.to_le_bytes()); // e_phnum
        put(&mut f, 58, &64u16.to_le_bytes()); // e_shentsize

        let phdr = |f: &mut Vec<u8>, at: usize, kind: u32, off: u64, filesz: u64, memsz: u64| {
            put(f, at, &kind.to_le_bytes());
            put(f, at + 4, &7u32.to_le_bytes());
            put(f, at + 8, &off.to_le_bytes());
            put(f, at + 16, &off.to_le_bytes());
            put(f, at + 24, &off.to_le_bytes());
            put(f, at + 32, &filesz.to_le_bytes());
            put(f, at + 40, &memsz.to_le_bytes());
            put(f, at + 48, &0x1000u64.to_le_bytes());
        };
        phdr(&mut f, 64, 1, 0, 0x200, TEST_LOAD_SIZE as u64);
        phdr(&mut f, 120, 2, 0x180, 0x40, 0x40);

        for (i, (tag, val)) in [(DT_RELA, 0x1c0u64), (DT_RELASZ, 24), (DT_RELAENT, 24), (DT_NULL, 0)]
            .into_iter()
            .enumerate()
        {
            put(&mut f, 0x180 + i * 16, &tag.to_le_bytes());
            put(&mut f, 0x188 + i * 16, &val.to_le_bytes());
        }

        put(&mut f, 0x1c0, &(TEST_RELOC_AT as u64).to_le_bytes());
        put(&mut f, 0x1c8, &reloc_type.to_le_bytes());
        put(&mut f, 0x1d0, &(TEST_ENTRY as u64).to_le_bytes());
        f
    }

    struct Host;

    impl PhysMemIf for Host {
        fn phys_to_virt(&self, paddr: HostPhysAddr) -> hvaddrspace::HostVirtAddr {
            hvaddrspace::HostVirtAddr::from(paddr.as_usize())
        }
    }

    #[test]
    fn sizes_and_entry() {
        let file = tiny_pie(R_X86_64_RELATIVE as u64);
        let image = ElfModule::parse(&file).unwrap();
        assert_eq!(image.load_size(), TEST_LOAD_SIZE);
        assert_eq!(image.entry(), TEST_ENTRY);
        assert_eq!(image.rela_table().unwrap(), Some((0x1c0, 1)));
    }

    #[test]
    fn relocates_against_base() {
        let file = tiny_pie(R_X86_64_RELATIVE as u64);
        let image = ElfModule::parse(&file).unwrap();

        let mut ram = std::vec![0xaau8; TEST_LOAD_SIZE];
        let base = HostPhysAddr::from(ram.as_mut_ptr() as usize);
        unsafe { image.load_relocatable(&Host, base).unwrap() };

        assert_eq!(&ram[..4], b"\x7fELF");
        let mut word = [0; 8];
        word.copy_from_slice(&ram[TEST_RELOC_AT..TEST_RELOC_AT + 8]);
        assert_eq!(u64::from_le_bytes(word), (base.as_usize() + TEST_ENTRY) as u64);
        // bss past the file data is cleared
        assert!(ram[0x200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_foreign_relocations() {
        // R_X86_64_64 needs a symbol table
        let file = tiny_pie(1);
        let image = ElfModule::parse(&file).unwrap();
        let mut ram = std::vec![0u8; TEST_LOAD_SIZE];
        let base = HostPhysAddr::from(ram.as_mut_ptr() as usize);
        assert!(unsafe { image.load_relocatable(&Host, base) }.is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ElfModule::parse(b"not an elf file at all, not even close....").is_err());

        let mut file = tiny_pie(R_X86_64_RELATIVE as u64);
        // move the load segment away from 0
        put(&mut file, 64 + 16, &0x40_0000u64.to_le_bytes());
        assert!(ElfModule::parse(&file).is_err());
    }
}
