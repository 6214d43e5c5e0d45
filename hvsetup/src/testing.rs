//! Test doubles shared by the unit tests.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use hvaddrspace::{HostPhysAddr, HostVirtAddr, PhysMemIf};

/// Page aligned host buffer standing for physical memory `[base, base + size)`.
pub struct FakeRam {
    base: usize,
    ptr: *mut u8,
    layout: Layout,
}

impl FakeRam {
    pub fn new(base: usize, size: usize) -> Self {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { base, ptr, layout }
    }

    /// Overwrites every byte, as stale memory left by firmware would be.
    pub fn dirty(&self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.ptr, byte, self.layout.size()) }
    }

    pub fn end(&self) -> usize {
        self.base + self.layout.size()
    }

    pub fn put(&self, paddr: usize, bytes: &[u8]) {
        unsafe { self.copy_to(HostPhysAddr::from(paddr), bytes) }
    }

    pub fn read_u64(&self, paddr: usize) -> u64 {
        let mut w = [0; 8];
        let src = self.phys_to_virt(HostPhysAddr::from(paddr)).as_ptr();
        unsafe { core::ptr::copy_nonoverlapping(src, w.as_mut_ptr(), 8) };
        u64::from_le_bytes(w)
    }
}

impl Drop for FakeRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

impl PhysMemIf for FakeRam {
    fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr {
        let paddr = paddr.as_usize();
        assert!(
            paddr >= self.base && paddr < self.end(),
            "{:#x} outside fake ram",
            paddr
        );
        HostVirtAddr::from(self.ptr as usize + (paddr - self.base))
    }
}

/// Memory that must not be touched.
pub struct NoRam;

impl PhysMemIf for NoRam {
    fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr {
        panic!("unexpected memory access at {:#x}", paddr.as_usize())
    }
}
