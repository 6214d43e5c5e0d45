//! Pieces of a bare-metal x86_64 platform.

use spin::Mutex;
use uart_16550::SerialPort;

use hvaddrspace::{HostPhysAddr, HostVirtAddr, PhysMemIf};
use svm_vcpu::{detect_paging_skillz, disabled_by_firmware, has_hardware_support};

use crate::info::BootInfo;

const COM1_BASE: u16 = 0x3f8;

static COM1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_BASE) });

/// Physical memory as seen by setup: the boot loader leaves paging off or
/// identity mapped.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMem;

impl PhysMemIf for IdentityMem {
    fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }
}

fn com1_write(s: &str) {
    use core::fmt::Write;
    let _ = COM1.lock().write_str(s);
}

/// Programs COM1 and routes the logger to it.
pub fn console_init() {
    COM1.lock().init();
    crate::logging::init(com1_write);
}

fn check_svm(present: bool, disabled: impl FnOnce() -> bool) -> Result<(), &'static str> {
    if !present {
        return Err("cpu lacks AMD-V");
    }
    if disabled() {
        return Err("svm disabled by firmware");
    }
    Ok(())
}

/// Fails if the CPU has no SVM or firmware locked it off, then records the
/// large page support of the host and of nested paging.
pub fn cpu_init(info: &mut BootInfo) {
    if let Err(msg) = check_svm(has_hardware_support(), disabled_by_firmware) {
        panic!("{}", msg);
    }
    let skillz = detect_paging_skillz();
    info.vmm.cpu.skillz = skillz;
    info.vm.cpu.skillz = skillz;
    info!(
        target: "setup",
        "cpu: svm, 2M pages {}, 1G pages {}",
        skillz.pg_2m,
        skillz.pg_1g
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svm_must_be_present_and_unlocked() {
        assert_eq!(check_svm(true, || false), Ok(()));
        assert_eq!(check_svm(true, || true), Err("svm disabled by firmware"));
        // VM_CR is not read without SVM
        assert_eq!(
            check_svm(false, || panic!("VM_CR read")),
            Err("cpu lacks AMD-V")
        );
    }
}
