use memoffset::offset_of;

use hvaddrspace::{HostPhysAddr, PAGE_SIZE};

use super::vmcb::Vmcb;

/// I/O permission map: one intercept bit per port, 12 KiB. (APM Vol. 2, 15.10.1)
///
/// Only the first 8 KiB + 1 bit are used by hardware, the trailing page
/// covers multi-byte accesses to the last ports.
#[repr(C, align(4096))]
pub struct IoPermissionMap {
    bitmap: [u8; 3 * PAGE_SIZE],
}

impl IoPermissionMap {
    pub fn set_intercept(&mut self, port: u16, intercept: bool) {
        let byte = port as usize / 8;
        let bit = port % 8;
        if intercept {
            self.bitmap[byte] |= 1 << bit;
        } else {
            self.bitmap[byte] &= !(1 << bit);
        }
    }

    pub fn set_intercept_of_range(&mut self, port_base: u16, count: u16, intercept: bool) {
        for port in port_base..port_base + count {
            self.set_intercept(port, intercept)
        }
    }

    pub fn is_intercepted(&self, port: u16) -> bool {
        self.bitmap[port as usize / 8] & (1 << (port % 8)) != 0
    }

    pub fn intercept_all(&mut self) {
        self.bitmap.fill(u8::MAX);
    }

    pub fn passthrough_all(&mut self) {
        self.bitmap.fill(0);
    }
}

/// MSR permission map: a read and a write bit per MSR in three ranges, 8 KiB.
/// (APM Vol. 2, 15.11)
#[repr(C, align(4096))]
pub struct MsrPermissionMap {
    bitmap: [u8; 2 * PAGE_SIZE],
}

impl MsrPermissionMap {
    /// Bit position of the read bit of `msr`, `None` outside the covered ranges.
    fn read_bit_of(msr: u32) -> Option<usize> {
        // each range is 2 KiB of bitmap, 2 bits per MSR
        let (range, index) = match msr {
            0..=0x1fff => (0, msr),
            0xc000_0000..=0xc000_1fff => (1, msr - 0xc000_0000),
            0xc001_0000..=0xc001_1fff => (2, msr - 0xc001_0000),
            _ => return None,
        };
        Some(range * 0x800 * 8 + index as usize * 2)
    }

    fn set_bit(&mut self, bit: usize, value: bool) {
        if value {
            self.bitmap[bit / 8] |= 1 << (bit % 8);
        } else {
            self.bitmap[bit / 8] &= !(1 << (bit % 8));
        }
    }

    fn set_intercept(&mut self, msr: u32, is_write: bool, intercept: bool) {
        match Self::read_bit_of(msr) {
            Some(bit) => self.set_bit(bit + is_write as usize, intercept),
            // outside the map every access is intercepted anyway
            None => warn!("MSR {:#x} is not covered by the permission map", msr),
        }
    }

    pub fn set_read_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_intercept(msr, false, intercept);
    }

    pub fn set_write_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_intercept(msr, true, intercept);
    }

    pub fn is_intercepted(&self, msr: u32, is_write: bool) -> bool {
        match Self::read_bit_of(msr) {
            Some(bit) => {
                let bit = bit + is_write as usize;
                self.bitmap[bit / 8] & (1 << (bit % 8)) != 0
            }
            None => true,
        }
    }

    pub fn intercept_all(&mut self) {
        self.bitmap.fill(u8::MAX);
    }

    pub fn passthrough_all(&mut self) {
        self.bitmap.fill(0);
    }
}

/// Every hardware structure one guest needs to run: its VMCB, the host VMCB
/// used across world switches, and the two permission maps.
///
/// Lives in the setup region, never on a stack.
#[repr(C, align(4096))]
pub struct VmControl {
    pub vm_vmcb: Vmcb,
    pub vmm_vmcb: Vmcb,
    pub iopm: IoPermissionMap,
    pub msrpm: MsrPermissionMap,
}

const _: () = assert!(core::mem::size_of::<VmControl>() == 7 * PAGE_SIZE);

impl VmControl {
    /// Physical address of the guest VMCB of the control block at `base`.
    pub fn vm_vmcb_paddr(base: HostPhysAddr) -> HostPhysAddr {
        base + offset_of!(VmControl, vm_vmcb)
    }

    /// Physical address of the host VMCB of the control block at `base`.
    pub fn vmm_vmcb_paddr(base: HostPhysAddr) -> HostPhysAddr {
        base + offset_of!(VmControl, vmm_vmcb)
    }

    /// Physical address of the I/O permission map of the control block at `base`.
    pub fn iopm_paddr(base: HostPhysAddr) -> HostPhysAddr {
        base + offset_of!(VmControl, iopm)
    }

    /// Physical address of the MSR permission map of the control block at `base`.
    pub fn msrpm_paddr(base: HostPhysAddr) -> HostPhysAddr {
        base + offset_of!(VmControl, msrpm)
    }
}
