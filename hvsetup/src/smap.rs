//! BIOS system memory map (E820 records).

use axerrno::{ax_err, AxResult};

use hvaddrspace::{page_align, HostPhysAddr, PhysMemIf, PAGE_SIZE};

/// Usable RAM.
pub const SMAP_USABLE: u32 = 1;

/// Highest address the setup area may end at: setup runs from low memory.
const AREA_LIMIT: u64 = 1 << 32;

/// One E820 extent, stored exactly as the BIOS reports it.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmapEntry {
    pub base: u64,
    pub len: u64,
    pub kind: u32,
}

impl SmapEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }

    pub fn is_usable(&self) -> bool {
        SMAP_USABLE == { self.kind }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[..8].copy_from_slice(&{ self.base }.to_le_bytes());
        out[8..16].copy_from_slice(&{ self.len }.to_le_bytes());
        out[16..].copy_from_slice(&{ self.kind }.to_le_bytes());
        out
    }
}

const _: () = assert!(SmapEntry::SIZE == 20);

/// Walks a multiboot memory map: every record is prefixed by a 32-bit size
/// that does not count itself.
#[derive(Clone)]
pub struct MultibootMmapIter<'a> {
    raw: &'a [u8],
}

impl<'a> MultibootMmapIter<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        Self { raw }
    }
}

fn le_u32(b: &[u8]) -> u32 {
    let mut w = [0; 4];
    w.copy_from_slice(&b[..4]);
    u32::from_le_bytes(w)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut w = [0; 8];
    w.copy_from_slice(&b[..8]);
    u64::from_le_bytes(w)
}

impl Iterator for MultibootMmapIter<'_> {
    type Item = SmapEntry;

    fn next(&mut self) -> Option<SmapEntry> {
        if self.raw.len() < 4 {
            return None;
        }
        let size = le_u32(self.raw) as usize;
        let rec = self.raw.get(4..4 + size)?;
        self.raw = &self.raw[4 + size..];
        if size < SmapEntry::SIZE {
            warn!(target: "pmem", "short smap record ({} bytes), map truncated", size);
            self.raw = &[];
            return None;
        }
        Some(SmapEntry {
            base: le_u64(rec),
            len: le_u64(&rec[8..]),
            kind: le_u32(&rec[16..]),
        })
    }
}

/// What the planner needs to know about the memory map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmapInfo {
    /// Number of records.
    pub nr: usize,
    /// End of the highest usable extent.
    pub mem_top: usize,
    /// Start of the usable extent the setup area is carved from.
    pub area_floor: usize,
    /// End of that extent, page aligned.
    pub area_end: usize,
}

impl SmapInfo {
    /// Bytes of the relocated copy.
    pub fn raw_size(&self) -> usize {
        self.nr * SmapEntry::SIZE
    }
}

/// Scans the multiboot memory map.
///
/// The setup area goes to the top of the highest usable extent ending at or
/// below 4 GiB.
pub fn smap_parse(mmap: &[u8]) -> AxResult<SmapInfo> {
    let mut info = SmapInfo::default();
    let mut area: Option<(u64, u64)> = None;

    for e in MultibootMmapIter::new(mmap) {
        info.nr += 1;
        trace!(
            target: "pmem",
            "smap {:#018x} - {:#018x} type {}",
            { e.base },
            e.end(),
            { e.kind }
        );
        if !e.is_usable() || { e.len } == 0 {
            continue;
        }
        info.mem_top = info.mem_top.max(e.end() as usize);
        if e.end() <= AREA_LIMIT && area.map_or(true, |(_, end)| e.end() > end) {
            area = Some((e.base, e.end()));
        }
    }

    if info.mem_top == 0 {
        return ax_err!(NotFound, "no usable memory in smap");
    }
    let Some((floor, end)) = area else {
        return ax_err!(NotFound, "no usable memory below 4GB");
    };
    info.area_floor = floor as usize;
    info.area_end = page_align(end as usize);
    if info.area_end < PAGE_SIZE {
        return ax_err!(NotFound, "no usable memory below 4GB");
    }
    Ok(info)
}

/// Copies the records of `mmap` as packed 20-byte entries to `raw`.
///
/// The usable extent holding the setup area is cut at `area_start`, so the
/// copy never advertises the area as free RAM.
///
/// # Safety
///
/// `raw` must be the smap slot of the setup area, sized for every record.
pub unsafe fn smap_init(
    mem: &impl PhysMemIf,
    mmap: &[u8],
    raw: HostPhysAddr,
    area_start: usize,
) -> usize {
    let area_start = area_start as u64;
    let mut nr = 0;
    for mut e in MultibootMmapIter::new(mmap) {
        if e.is_usable() && { e.base } <= area_start && area_start < e.end() {
            e.len = area_start - e.base;
        }
        mem.copy_to(raw + nr * SmapEntry::SIZE, &e.to_bytes());
        nr += 1;
    }
    nr
}
