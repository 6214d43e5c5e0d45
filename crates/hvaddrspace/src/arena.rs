use axerrno::{ax_err, AxResult};

use crate::{HostPhysAddr, PhysPtr};

/// A bump cursor over the physical range `[start, end)`.
///
/// Every placement advances the cursor by an exact byte count and fails
/// instead of crossing `end`. Nothing is ever freed.
#[derive(Debug)]
pub struct RegionArena {
    start: usize,
    cursor: usize,
    end: usize,
}

impl RegionArena {
    pub fn new(start: HostPhysAddr, end: HostPhysAddr) -> Self {
        assert!(start.as_usize() <= end.as_usize());
        Self {
            start: start.as_usize(),
            cursor: start.as_usize(),
            end: end.as_usize(),
        }
    }

    /// The next address to be handed out.
    pub fn cursor(&self) -> HostPhysAddr {
        HostPhysAddr::from(self.cursor)
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.cursor - self.start
    }

    /// Bytes left before `end`.
    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }

    /// Takes the next `size` bytes and returns their start address.
    pub fn take(&mut self, size: usize) -> AxResult<HostPhysAddr> {
        if size > self.remaining() {
            warn!(
                "region overrun: {:#x} bytes requested at {:#x}, {:#x} left",
                size,
                self.cursor,
                self.remaining()
            );
            return ax_err!(NoMemory, "setup region exhausted");
        }
        let at = self.cursor;
        self.cursor += size;
        Ok(HostPhysAddr::from(at))
    }

    /// Takes room for `count` consecutive `T` and returns a handle on the first one.
    pub fn take_array<T>(&mut self, count: usize) -> AxResult<PhysPtr<T>> {
        self.take(count * core::mem::size_of::<T>())
            .map(PhysPtr::new)
    }

    /// Takes room for one `T`.
    pub fn take_one<T>(&mut self) -> AxResult<PhysPtr<T>> {
        self.take_array(1)
    }

    /// Bytes between the cursor and the next multiple of `align`.
    pub fn gap(&self, align: usize) -> usize {
        memory_addr::align_up(self.cursor, align) - self.cursor
    }
}
