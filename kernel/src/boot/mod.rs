//! Boot orchestration
//!
//! The Multiboot2 entry stub (assembly, part of the platform layer) calls
//! [`kernel_main`] with the loader's magic register, the physical address
//! of the info block, and the end of the kernel image from the linker
//! script. This module brings the memory core up in order:
//!
//! 1. logger, 2. memory-map selection, 3. buddy seed, 4. frame table,
//! 5. CPU features (PSE/NX), 6. kernel page directory, 7. CR3 load,
//! 8. physical-window rebase, 9. kernel heap.
//!
//! Everything beyond the memory core (GDT/IDT install, drivers,
//! filesystem mount, scheduler start, first user process) belongs to the
//! platform layer and runs after this returns.

pub mod multiboot;

use crate::config::KERNEL_VIRT_BASE;
use crate::error::KernelResult;
use crate::mm::{self, buddy::BUDDY, frame, heap, paging};
use crate::{arch::x86::cpu, klog};

/// Initialize the memory and process-creation core.
///
/// # Safety
///
/// Must be called exactly once, on the boot CPU, with interrupts disabled,
/// while physical memory is still identity-addressable. `mb_info_phys`
/// must point at the loader's info block and `kernel_image_end` at the
/// first byte past the loaded kernel image.
pub unsafe fn init_memory(
    magic: u32,
    mb_info_phys: usize,
    kernel_image_end: usize,
) -> KernelResult<()> {
    klog::init();
    log::info!(target: "boot", "multiboot info at {:#010x}", mb_info_phys);

    // SAFETY: forwarded from our own caller contract.
    let region = unsafe { multiboot::select_boot_region(magic, mb_info_phys, kernel_image_end)? };

    let managed = {
        let mut buddy = BUDDY.lock();
        buddy.init(region.base, region.size)?;
        buddy.managed_bytes()
    };
    frame::init(region.base, managed)?;

    cpu::detect_and_enable_features();

    let (_pd_virt, pd) = paging::initialize_directory(region.base + managed)?;
    // SAFETY: the directory maps the kernel image and the managed region
    // at identity and higher half; interrupts are disabled per our
    // contract.
    unsafe { paging::activate(pd) };
    mm::rebase_phys_window(KERNEL_VIRT_BASE);

    heap::init()?;

    log::info!(
        target: "boot",
        "memory core up: {} KiB free",
        frame::free_space() / 1024
    );
    Ok(())
}

/// C-ABI entry the boot stub jumps to after setting up a boot stack.
/// Returns 0 on success, a negative status when bring-up failed (the stub
/// halts either way on failure).
#[cfg(target_arch = "x86")]
#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, mb_info_phys: u32, kernel_image_end: u32) -> i32 {
    // SAFETY: the stub calls us exactly once with interrupts disabled,
    // before paging is enabled.
    match unsafe { init_memory(magic, mb_info_phys as usize, kernel_image_end as usize) } {
        Ok(()) => 0,
        Err(err) => {
            log::error!(target: "boot", "memory bring-up failed: {}", err);
            -1
        }
    }
}
