use core::fmt;
use core::marker::PhantomData;

use crate::{HostPhysAddr, HostVirtAddr};

/// The low-level helpers the setup stage needs to touch physical memory.
///
/// On bare metal the setup stage runs with an identity mapping, so the
/// implementation is a plain cast. Tests back physical memory with a host
/// buffer instead.
pub trait PhysMemIf {
    /// Converts a host physical address to an address the running code can dereference.
    fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr;

    /// Fills `size` bytes at `paddr` with `byte`.
    ///
    /// # Safety
    ///
    /// `[paddr, paddr + size)` must be backed memory owned by the caller.
    unsafe fn fill(&self, paddr: HostPhysAddr, byte: u8, size: usize) {
        core::ptr::write_bytes(self.phys_to_virt(paddr).as_mut_ptr(), byte, size)
    }

    /// Copies `src` to `paddr`.
    ///
    /// # Safety
    ///
    /// `[paddr, paddr + src.len())` must be backed memory owned by the caller.
    unsafe fn copy_to(&self, paddr: HostPhysAddr, src: &[u8]) {
        core::ptr::copy_nonoverlapping(
            src.as_ptr(),
            self.phys_to_virt(paddr).as_mut_ptr(),
            src.len(),
        )
    }
}

/// A typed handle on a `T` stored at a host physical address.
///
/// The handle itself is plain data (it is copied around inside the boot
/// info block), dereferencing it goes through a [`PhysMemIf`].
#[repr(transparent)]
pub struct PhysPtr<T> {
    paddr: HostPhysAddr,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> PhysPtr<T> {
    /// A handle that points nowhere.
    pub const fn null() -> Self {
        Self::new(HostPhysAddr::from_usize(0))
    }

    pub const fn new(paddr: HostPhysAddr) -> Self {
        Self {
            paddr,
            _phantom: PhantomData,
        }
    }

    pub const fn paddr(&self) -> HostPhysAddr {
        self.paddr
    }

    pub const fn is_null(&self) -> bool {
        self.paddr.as_usize() == 0
    }

    /// The handle `count` objects below this one.
    pub fn sub(self, count: usize) -> Self {
        Self::new(HostPhysAddr::from_usize(
            self.paddr.as_usize() - count * core::mem::size_of::<T>(),
        ))
    }

    /// The handle `count` objects above this one.
    pub fn add(self, count: usize) -> Self {
        Self::new(self.paddr + count * core::mem::size_of::<T>())
    }

    /// Reinterprets the handle as pointing to a `U`.
    pub const fn cast<U>(self) -> PhysPtr<U> {
        PhysPtr::new(self.paddr)
    }

    pub fn as_mut_ptr(&self, mem: &impl PhysMemIf) -> *mut T {
        mem.phys_to_virt(self.paddr).as_mut_ptr() as *mut T
    }

    /// Borrows the object behind the handle.
    ///
    /// # Safety
    ///
    /// The handle must point to a live, properly aligned `T` and no other
    /// reference to it may exist for `'a`.
    pub unsafe fn as_mut<'a>(&self, mem: &impl PhysMemIf) -> &'a mut T {
        &mut *self.as_mut_ptr(mem)
    }

    /// Moves `value` into the memory behind the handle without reading or
    /// dropping what was there.
    ///
    /// # Safety
    ///
    /// The handle must point to writable memory sized and aligned for `T`.
    pub unsafe fn write(&self, mem: &impl PhysMemIf, value: T) {
        core::ptr::write(self.as_mut_ptr(mem), value)
    }
}

impl<T> Clone for PhysPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PhysPtr<T> {}

impl<T> PartialEq for PhysPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.paddr == other.paddr
    }
}

impl<T> Eq for PhysPtr<T> {}

impl<T> fmt::Debug for PhysPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysPtr({:#x})", self.paddr.as_usize())
    }
}

impl<T> fmt::LowerHex for PhysPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.paddr.as_usize(), f)
    }
}
