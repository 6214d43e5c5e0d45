//! Descriptor table of the page pool.
//!
//! The pool hands out guest PDs and PTs once the monitor runs. Setup only
//! lays the descriptors out and chains every page into the free list.

use hvaddrspace::{HostPhysAddr, PhysMemIf, PhysPtr, PAGE_SIZE};

/// Terminates the free list.
pub const POOL_END: u32 = u32::MAX;

/// Descriptor of one pool page.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolPageDesc {
    /// Physical address of the page.
    pub addr: u64,
    /// Index of the next free descriptor, or [`POOL_END`].
    pub next: u32,
    pub flags: u32,
}

const _: () = assert!(core::mem::size_of::<PoolPageDesc>() == 16);

/// The pool as recorded in the boot info block.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PoolDesc {
    pub addr: HostPhysAddr,
    /// Bytes, a multiple of the page size.
    pub sz: usize,
    /// One descriptor per page.
    pub all: PhysPtr<PoolPageDesc>,
    /// Index of the first free descriptor.
    pub free: u32,
}

impl PoolDesc {
    pub const fn empty() -> Self {
        Self {
            addr: HostPhysAddr::from_usize(0),
            sz: 0,
            all: PhysPtr::null(),
            free: POOL_END,
        }
    }

    pub const fn pages(&self) -> usize {
        self.sz / PAGE_SIZE
    }
}

/// Size of the descriptor table for a pool of `pool_sz` bytes.
pub const fn pool_desc_size(pool_sz: usize) -> usize {
    core::mem::size_of::<PoolPageDesc>() * (pool_sz / PAGE_SIZE)
}

/// Fills the descriptor table and puts every page on the free list.
///
/// # Safety
///
/// `pool.all` must point to a table with room for `pool.pages()` descriptors.
pub unsafe fn pool_init(mem: &impl PhysMemIf, pool: &mut PoolDesc) {
    let pages = pool.pages();
    for i in 0..pages {
        let next = if i + 1 < pages {
            (i + 1) as u32
        } else {
            POOL_END
        };
        pool.all.add(i).write(
            mem,
            PoolPageDesc {
                addr: (pool.addr.as_usize() + i * PAGE_SIZE) as u64,
                next,
                flags: 0,
            },
        );
    }
    pool.free = if pages == 0 { POOL_END } else { 0 };
    debug!(target: "pmem", "pool: {} pages at {:#x}", pages, pool.addr.as_usize());
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvaddrspace::HostVirtAddr;

    struct Host;

    impl PhysMemIf for Host {
        fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr {
            HostVirtAddr::from(paddr.as_usize())
        }
    }

    #[test]
    fn chains_every_page() {
        let mut table = [PoolPageDesc::default(); 3];
        let mut pool = PoolDesc {
            addr: HostPhysAddr::from(0x40_0000),
            sz: 3 * PAGE_SIZE,
            all: PhysPtr::new(HostPhysAddr::from(table.as_mut_ptr() as usize)),
            free: POOL_END,
        };
        unsafe { pool_init(&Host, &mut pool) };

        assert_eq!(pool.free, 0);
        assert_eq!(table[0].addr, 0x40_0000);
        assert_eq!(table[0].next, 1);
        assert_eq!(table[2].addr, 0x40_2000);
        assert_eq!(table[2].next, POOL_END);
        assert_eq!(pool_desc_size(pool.sz), 48);
    }

    #[test]
    fn empty_pool_has_no_free_page() {
        let mut pool = PoolDesc::empty();
        unsafe { pool_init(&Host, &mut pool) };
        assert_eq!(pool.free, POOL_END);
        assert_eq!(pool.pages(), 0);
    }
}
