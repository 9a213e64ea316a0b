//! Kernel-stack allocation
//!
//! Every process gets a kernel stack mapped into the *kernel* page
//! directory (the stack is only used in ring 0, and its region's page
//! tables are part of the kernel-PDE copy every process inherits).
//!
//! Virtual ranges come from a bump pointer over
//! `[KERNEL_STACK_VIRT_START, KERNEL_STACK_VIRT_END)` fronted by a
//! size-class free list: all stacks share one size, so a destroyed
//! process's range is simply reused.
//!
//! Reference counting: each stack frame carries two references while the
//! stack is alive, the allocation hold recorded in the PCB and the kernel
//! PD mapping. Teardown drops both, per-page lookup+put first, then the
//! range unmap.

extern crate alloc;

use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{
    KERNEL_STACK_VIRT_END, KERNEL_STACK_VIRT_START, PAGE_SIZE, PROCESS_KSTACK_SIZE,
};
use crate::error::{KernelError, KernelResult};
use crate::mm::paging::{self, PteFlags};
use crate::mm::{frame, VirtAddr};

/// A live kernel stack: its mapped virtual range and, for diagnostics,
/// the physical base of its first frame.
#[derive(Debug)]
pub struct KernelStack {
    /// Highest address + 1; the value published to the TSS
    pub vaddr_top: usize,
    pub phys_base: usize,
}

impl KernelStack {
    pub fn vaddr_base(&self) -> usize {
        self.vaddr_top - PROCESS_KSTACK_SIZE
    }
}

/// Virtual-range allocator for kernel stacks: bump pointer plus a free
/// list of returned ranges (one size class, so any entry fits any
/// request).
pub(crate) struct StackRangeAllocator {
    next: usize,
    free: Vec<usize>,
}

impl StackRangeAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            next: KERNEL_STACK_VIRT_START,
            free: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self) -> KernelResult<usize> {
        if let Some(base) = self.free.pop() {
            return Ok(base);
        }
        let base = self.next;
        let end = base
            .checked_add(PROCESS_KSTACK_SIZE)
            .ok_or(KernelError::KernelStackExhausted)?;
        if end > KERNEL_STACK_VIRT_END {
            return Err(KernelError::KernelStackExhausted);
        }
        self.next = end;
        Ok(base)
    }

    /// Return a range. A range that is still the last one bumped simply
    /// rewinds the pointer.
    pub(crate) fn free(&mut self, base: usize) {
        if base + PROCESS_KSTACK_SIZE == self.next {
            self.next = base;
        } else {
            self.free.push(base);
        }
    }
}

static STACK_RANGES: Mutex<StackRangeAllocator> = Mutex::new(StackRangeAllocator::new());

/// Allocate, map and account a kernel stack. On any failure every frame,
/// mapping and the virtual range are rolled back.
pub fn allocate_kernel_stack() -> KernelResult<KernelStack> {
    debug_assert!(PROCESS_KSTACK_SIZE % PAGE_SIZE == 0 && PROCESS_KSTACK_SIZE > 0);
    let num_pages = PROCESS_KSTACK_SIZE / PAGE_SIZE;

    let mut frames: Vec<crate::mm::PhysAddr> = Vec::with_capacity(num_pages);
    for _ in 0..num_pages {
        match frame::frame_alloc() {
            Ok(f) => frames.push(f),
            Err(err) => {
                for &f in &frames {
                    frame::put_frame(f);
                }
                return Err(err);
            }
        }
    }

    let base = match STACK_RANGES.lock().alloc() {
        Ok(base) => base,
        Err(err) => {
            for &f in &frames {
                frame::put_frame(f);
            }
            return Err(err);
        }
    };

    let kernel_pd = paging::kernel_directory();
    for (i, &f) in frames.iter().enumerate() {
        let vaddr = VirtAddr::new(base + i * PAGE_SIZE);
        match paging::map_single_4k(kernel_pd, vaddr, f, PteFlags::kernel_data()) {
            Ok(()) => {
                // Second reference: the mapping, alongside the PCB's hold
                frame::get_frame(f);
            }
            Err(err) => {
                // Drop the mapping references taken so far, then every
                // allocation hold, then rewind the range.
                paging::unmap_range(kernel_pd, VirtAddr::new(base), i);
                for &f in &frames {
                    frame::put_frame(f);
                }
                STACK_RANGES.lock().free(base);
                return Err(err);
            }
        }
    }

    log::debug!(
        target: "process",
        "kernel stack [{:#010x}-{:#010x}) phys base {:#010x}",
        base,
        base + PROCESS_KSTACK_SIZE,
        frames[0].as_usize()
    );
    Ok(KernelStack {
        vaddr_top: base + PROCESS_KSTACK_SIZE,
        phys_base: frames[0].as_usize(),
    })
}

/// Release a kernel stack: per-page physical lookup and reference drop
/// (the PCB's hold), then the range unmap (the mapping's reference), then
/// the virtual range itself.
pub fn free_kernel_stack(stack: KernelStack) {
    let base = stack.vaddr_base();
    let num_pages = PROCESS_KSTACK_SIZE / PAGE_SIZE;
    let kernel_pd = paging::kernel_directory();

    for i in 0..num_pages {
        let vaddr = VirtAddr::new(base + i * PAGE_SIZE);
        match paging::get_physical_address(kernel_pd, vaddr) {
            Ok(phys) => frame::put_frame(phys),
            Err(_) => {
                log::warn!(
                    target: "process",
                    "kernel stack page {:#010x} already unmapped",
                    vaddr.as_usize()
                );
            }
        }
    }
    paging::unmap_range(kernel_pd, VirtAddr::new(base), num_pages);
    STACK_RANGES.lock().free(base);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ranges_bump_reuse_and_exhaust() {
        let mut ranges = StackRangeAllocator::new();
        let a = ranges.alloc().expect("first range");
        let b = ranges.alloc().expect("second range");
        assert_eq!(a, KERNEL_STACK_VIRT_START);
        assert_eq!(b, a + PROCESS_KSTACK_SIZE);

        // Freeing the last range rewinds the bump pointer
        ranges.free(b);
        assert_eq!(ranges.alloc().expect("rewound range"), b);

        // Freeing an interior range goes through the free list
        ranges.free(a);
        assert_eq!(ranges.alloc().expect("reused range"), a);
    }

    #[test]
    fn region_exhaustion_is_reported() {
        let mut ranges = StackRangeAllocator::new();
        let capacity =
            (KERNEL_STACK_VIRT_END - KERNEL_STACK_VIRT_START) / PROCESS_KSTACK_SIZE;
        for _ in 0..capacity {
            ranges.alloc().expect("in-capacity range");
        }
        assert_eq!(ranges.alloc(), Err(KernelError::KernelStackExhausted));

        // A freed range makes one more allocation possible again
        ranges.free(KERNEL_STACK_VIRT_START);
        assert_eq!(ranges.alloc(), Ok(KERNEL_STACK_VIRT_START));
    }
}
