//! Kernel heap
//!
//! A `linked_list_allocator::LockedHeap` is the global allocator on bare
//! metal. Its backing storage is carved from the buddy-managed region at
//! boot and reached through the shared kernel mapping, so heap objects
//! stay addressable under every address space. Host builds (unit tests)
//! use the system allocator instead; see `lib.rs`.

use crate::config::KERNEL_HEAP_SIZE;
use crate::error::KernelResult;

/// Carve the heap out of the buddy region and hand it to the global
/// allocator. Must run after `paging::activate` + the window rebase and
/// before the first `alloc` use.
pub fn init() -> KernelResult<()> {
    #[cfg(target_os = "none")]
    {
        use super::{buddy::BUDDY, phys_to_virt};

        let block = BUDDY.lock().alloc(KERNEL_HEAP_SIZE)?;
        let base = phys_to_virt(block);
        // SAFETY: the block is exclusively ours, KERNEL_HEAP_SIZE bytes,
        // mapped writable in the kernel half; init is called exactly once.
        unsafe {
            crate::ALLOCATOR.lock().init(base, KERNEL_HEAP_SIZE);
        }
        log::info!(
            target: "heap",
            "{} KiB kernel heap at {:p}",
            KERNEL_HEAP_SIZE / 1024,
            base
        );
    }
    Ok(())
}

/// Bytes still free in the kernel heap (bare metal only; the host harness
/// delegates to the system allocator).
pub fn free_bytes() -> usize {
    #[cfg(target_os = "none")]
    {
        crate::ALLOCATOR.lock().free()
    }
    #[cfg(not(target_os = "none"))]
    {
        usize::MAX
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;
    use alloc::{boxed::Box, vec::Vec};

    #[test]
    fn allocation_works_under_the_test_allocator() {
        let x = Box::new(42u32);
        assert_eq!(*x, 42);

        let mut v = Vec::new();
        for i in 0..100 {
            v.push(i);
        }
        assert_eq!(v.len(), 100);
    }

    #[test]
    fn heap_size_is_page_multiple() {
        use crate::config::{KERNEL_HEAP_SIZE, PAGE_SIZE};
        assert_eq!(KERNEL_HEAP_SIZE % PAGE_SIZE, 0);
    }
}
