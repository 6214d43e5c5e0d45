//! Host physical address space helpers for the hypervisor setup stage.
//!
//! This crate contains:
//! - [`PhysPtr`]: a typed handle on an object living at a host physical address.
//! - [`PhysMemIf`]: the interface used to reach physical memory from the running code.
//! - [`paging`]: paging-structure geometry and the [`paging::predict`] requirement predictor.
//! - [`RegionArena`]: a checked bump cursor over a single contiguous physical region.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

mod arena;
mod phys;

pub mod paging;

pub use arena::RegionArena;
pub use phys::{PhysMemIf, PhysPtr};

pub use memory_addr::{PhysAddr, VirtAddr, PAGE_SIZE_4K as PAGE_SIZE};

/// Host virtual address.
pub type HostVirtAddr = VirtAddr;
/// Host physical address.
pub type HostPhysAddr = PhysAddr;
/// Guest physical address.
pub type GuestPhysAddr = usize;

/// Size of a 2 MiB large page.
pub const PAGE_SIZE_2M: usize = 0x20_0000;
/// Size of a 1 GiB large page.
pub const PAGE_SIZE_1G: usize = 0x4000_0000;

/// Rounds `addr` down to a page boundary.
#[inline]
pub const fn page_align(addr: usize) -> usize {
    memory_addr::align_down_4k(addr)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_align_next(addr: usize) -> usize {
    memory_addr::align_up_4k(addr)
}

/// Whether `addr` sits on a page boundary.
#[inline]
pub const fn page_aligned(addr: usize) -> bool {
    memory_addr::is_aligned_4k(addr)
}

/// Rounds `addr` up to the machine word size.
#[inline]
pub const fn long_align_next(addr: usize) -> usize {
    memory_addr::align_up(addr, core::mem::size_of::<usize>())
}
