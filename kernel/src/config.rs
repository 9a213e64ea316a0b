//! Fixed virtual-memory layout and kernel tunables
//!
//! Everything here is a compile-time constant; nothing is read from the
//! environment. The virtual layout is the contract shared with the boot
//! stub, the GDT/IDT installer and the linker script.

/// Size of a 4 KiB page / physical frame
pub const PAGE_SIZE: usize = 4096;

/// Size of a 4 MiB large page (PSE)
pub const PAGE_SIZE_LARGE: usize = 4 * 1024 * 1024;

/// Entries per page table / page directory (32-bit non-PAE)
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Start of kernel virtual address space (higher half)
pub const KERNEL_VIRT_BASE: usize = 0xC000_0000;

/// Index of the PDE covering `KERNEL_VIRT_BASE`
pub const KERNEL_PDE_INDEX: usize = KERNEL_VIRT_BASE >> 22; // 768

/// Kernel-stack virtual region, one stack per process
pub const KERNEL_STACK_VIRT_START: usize = 0xE000_0000;
pub const KERNEL_STACK_VIRT_END: usize = 0xF000_0000;

/// Dedicated single-page slot for short-lived kernel mappings.
/// Last page of the table referenced by PDE 1022.
pub const PAGING_TEMP_VADDR: usize = 0xFFBF_F000;

/// The recursive self-map makes the active page directory visible here
pub const RECURSIVE_PD_VADDR: usize = 0xFFFF_F000;

/// Base of the recursive page-table window (table `k` at base + k * 4096)
pub const RECURSIVE_PT_WINDOW: usize = 0xFFC0_0000;

/// Index of the recursive PDE (the last slot)
pub const RECURSIVE_PDE_INDEX: usize = 1023;

/// Top of the user stack, one page below the kernel base
pub const USER_STACK_TOP_VIRT: usize = 0xBFFF_F000;

/// Initial span of the grows-down user-stack VMA (4 MiB)
pub const USER_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Bottom of the initial user-stack VMA
pub const USER_STACK_BOTTOM_VIRT: usize = USER_STACK_TOP_VIRT - USER_STACK_SIZE;

/// Per-process kernel stack size. Must be a multiple of `PAGE_SIZE`.
pub const PROCESS_KSTACK_SIZE: usize = 16 * 1024;

/// Smallest buddy block: one page
pub const BUDDY_MIN_ORDER: u32 = 12;

/// Largest buddy block: 64 MiB. The managed region is clamped to this.
pub const BUDDY_MAX_ORDER: u32 = 26;

/// Kernel heap carved out of the managed region at boot
pub const KERNEL_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Physical RAM below this is never handed to the buddy (BIOS, legacy hole)
pub const LOW_MEMORY_LIMIT: usize = 0x10_0000;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn layout_is_internally_consistent() {
        assert_eq!(KERNEL_PDE_INDEX, 768);
        assert_eq!(PAGING_TEMP_VADDR >> 22, 1022);
        assert_eq!(RECURSIVE_PD_VADDR >> 22, RECURSIVE_PDE_INDEX);
        assert_eq!(USER_STACK_TOP_VIRT % PAGE_SIZE, 0);
        assert!(USER_STACK_TOP_VIRT < KERNEL_VIRT_BASE);
        assert!(USER_STACK_BOTTOM_VIRT < USER_STACK_TOP_VIRT);
        assert_eq!(PROCESS_KSTACK_SIZE % PAGE_SIZE, 0);
        assert!(KERNEL_STACK_VIRT_START >= KERNEL_VIRT_BASE);
    }
}
