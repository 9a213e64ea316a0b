//! Page-fault handling
//!
//! The assembly ISR stub for vector 14 pushes a [`TrapFrame`] and calls
//! [`page_fault_handler`]. The handler decodes CR2 and the error code,
//! resolves the fault against the current process's address space, and
//! either returns (mapping installed, access retried) or terminates the
//! offending process. Faults the kernel itself takes at unexpected
//! addresses are fatal.

use super::address_space::{FaultAccess, FaultContext, FaultOutcome};
use crate::arch::x86::cpu;
use crate::arch::x86::trap::{pf_err, TrapFrame};
use crate::config::KERNEL_VIRT_BASE;
use crate::process;

/// Everything the VMA dispatch needs, decoded from the trap.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub faulting_address: usize,
    pub access: FaultAccess,
    pub was_user_mode: bool,
    pub pte_present: bool,
    pub instruction_pointer: u32,
}

/// Build a [`PageFaultInfo`] from the error code and CR2.
///
/// Error code bits (Intel SDM): bit 0 present, bit 1 write, bit 2 user,
/// bit 4 instruction fetch. The fetch bit only arrives once EFER.NXE is
/// set; the software NX marker in the PTE is what makes it a permission
/// error.
pub fn decode(err_code: u32, cr2: usize, eip: u32) -> PageFaultInfo {
    let access = if err_code & pf_err::INSTRUCTION_FETCH != 0 {
        FaultAccess::InstructionFetch
    } else if err_code & pf_err::WRITE != 0 {
        FaultAccess::Write
    } else {
        FaultAccess::Read
    };
    PageFaultInfo {
        faulting_address: cr2,
        access,
        was_user_mode: err_code & pf_err::USER != 0,
        pte_present: err_code & pf_err::PRESENT != 0,
        instruction_pointer: eip,
    }
}

/// Entry point called by the vector-14 stub.
pub extern "C" fn page_fault_handler(frame: &TrapFrame) {
    let info = decode(frame.err_code, cpu::read_cr2(), frame.eip);
    handle(&info);
}

fn handle(info: &PageFaultInfo) {
    // Ring-0 faults on kernel addresses never resolve through VMAs.
    if !info.was_user_mode && info.faulting_address >= KERNEL_VIRT_BASE {
        panic!(
            "kernel page fault at {:#010x} (eip={:#010x}, {:?})",
            info.faulting_address, info.instruction_pointer, info.access
        );
    }

    let Some(proc) = process::current() else {
        panic!(
            "page fault at {:#010x} with no current process (eip={:#010x})",
            info.faulting_address, info.instruction_pointer
        );
    };

    let ctx = FaultContext {
        access: info.access,
        present: info.pte_present,
    };
    let outcome = {
        let mut space = proc.address_space.lock();
        match space.as_mut() {
            Some(mm) => mm.handle_fault(info.faulting_address, ctx),
            None => Ok(FaultOutcome::Segv("process has no address space")),
        }
    };

    match outcome {
        Ok(FaultOutcome::Resolved) => {}
        Ok(FaultOutcome::Segv(reason)) => {
            log::warn!(
                target: "fault",
                "pid {} segfault at {:#010x} (eip={:#010x}): {}",
                proc.pid,
                info.faulting_address,
                info.instruction_pointer,
                reason
            );
            if info.was_user_mode {
                process::terminate_current();
            } else {
                panic!(
                    "kernel-mode fault at {:#010x} unresolvable: {}",
                    info.faulting_address, reason
                );
            }
        }
        Err(err) => {
            log::error!(
                target: "fault",
                "pid {} fault at {:#010x} failed: {}",
                proc.pid,
                info.faulting_address,
                err
            );
            if info.was_user_mode {
                process::terminate_current();
            } else {
                panic!(
                    "kernel-mode fault at {:#010x}: {}",
                    info.faulting_address, err
                );
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn error_code_decoding() {
        // User write to an absent page
        let info = decode(pf_err::WRITE | pf_err::USER, 0xBFBF_E010, 0x0804_8123);
        assert_eq!(info.access, FaultAccess::Write);
        assert!(info.was_user_mode);
        assert!(!info.pte_present);
        assert_eq!(info.faulting_address, 0xBFBF_E010);

        // Instruction fetch wins over the write bit
        let info = decode(
            pf_err::PRESENT | pf_err::USER | pf_err::INSTRUCTION_FETCH,
            0x0804_9000,
            0,
        );
        assert_eq!(info.access, FaultAccess::InstructionFetch);
        assert!(info.pte_present);

        // Kernel read of an absent page
        let info = decode(0, 0xC010_0000, 0);
        assert_eq!(info.access, FaultAccess::Read);
        assert!(!info.was_user_mode);
    }
}
