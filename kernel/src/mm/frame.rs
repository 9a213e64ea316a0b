//! Per-frame reference counting over the buddy allocator
//!
//! Every 4 KiB frame in the buddy-managed range has a reference count.
//! Allocation sets it to 1, each additional mapping takes another
//! reference, and the frame returns to the buddy when the count reaches
//! zero. Frames outside the managed range (MMIO, ROM) are treated as
//! count-infinity: never tracked, never freed.

use spin::Mutex;

use super::buddy::{BuddyAllocator, BUDDY};
use super::{phys_to_virt, PhysAddr};
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};

pub struct FrameTable {
    /// Physical base of the tracked range
    base: usize,
    /// Number of tracked frames
    frame_count: usize,
    /// Physical address of the count array (one `u16` per frame),
    /// reached through the physical window
    counts_phys: usize,
    initialized: bool,
}

// SAFETY: the raw table pointer is only dereferenced through the physical
// window while the containing Mutex is held.
unsafe impl Send for FrameTable {}

impl FrameTable {
    pub const fn empty() -> Self {
        Self {
            base: 0,
            frame_count: 0,
            counts_phys: 0,
            initialized: false,
        }
    }

    /// Build the count table for `[base, base + size)`, taking its backing
    /// storage from `buddy`. All counts start at zero.
    pub fn init(
        &mut self,
        buddy: &mut BuddyAllocator,
        base: usize,
        size: usize,
    ) -> KernelResult<()> {
        let frame_count = size / PAGE_SIZE;
        let table_bytes = frame_count * core::mem::size_of::<u16>();
        let table = buddy.alloc(table_bytes)?;

        // SAFETY: the block was just handed to us by the buddy and is
        // inside the managed region covered by the physical window.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(table), 0, table_bytes);
        }

        self.base = base;
        self.frame_count = frame_count;
        self.counts_phys = table.as_usize();
        self.initialized = true;
        log::info!(
            target: "frame",
            "tracking {} frames from {:#010x}",
            frame_count,
            base
        );
        Ok(())
    }

    fn index_of(&self, phys: PhysAddr) -> Option<usize> {
        if !self.initialized || !phys.is_page_aligned() {
            return None;
        }
        let offset = phys.as_usize().wrapping_sub(self.base);
        let index = offset / PAGE_SIZE;
        (offset < self.frame_count * PAGE_SIZE).then_some(index)
    }

    fn count_slot(&self, index: usize) -> *mut u16 {
        // SAFETY of deref is argued at each call site; the pointer itself
        // is in-bounds by construction (index < frame_count).
        unsafe { (phys_to_virt(PhysAddr::new(self.counts_phys)) as *mut u16).add(index) }
    }

    /// Allocate one frame with reference count 1.
    pub fn alloc(&mut self, buddy: &mut BuddyAllocator) -> KernelResult<PhysAddr> {
        let frame = buddy.alloc(PAGE_SIZE)?;
        if let Some(index) = self.index_of(frame) {
            // SAFETY: slot is in-bounds; we hold exclusive access.
            unsafe { *self.count_slot(index) = 1 };
        }
        Ok(frame)
    }

    /// Take an additional reference on `phys`. Saturates (with an error
    /// log) instead of wrapping.
    pub fn get(&mut self, phys: PhysAddr) {
        let Some(index) = self.index_of(phys) else {
            return; // untracked: count-infinity
        };
        // SAFETY: in-bounds slot, exclusive access.
        unsafe {
            let slot = self.count_slot(index);
            if *slot == u16::MAX {
                log::error!(target: "frame", "refcount overflow at {:#010x}", phys.as_usize());
            } else {
                *slot += 1;
            }
        }
    }

    /// Drop a reference on `phys`; on the transition to zero the frame
    /// goes back to `buddy`.
    pub fn put(&mut self, buddy: &mut BuddyAllocator, phys: PhysAddr) {
        let Some(index) = self.index_of(phys) else {
            return; // untracked: count-infinity
        };
        // SAFETY: in-bounds slot, exclusive access.
        unsafe {
            let slot = self.count_slot(index);
            match *slot {
                0 => {
                    log::error!(
                        target: "frame",
                        "put_frame on free frame {:#010x}",
                        phys.as_usize()
                    );
                }
                1 => {
                    *slot = 0;
                    buddy.free(phys, PAGE_SIZE);
                }
                n => *slot = n - 1,
            }
        }
    }

    /// Current reference count, or `None` for untracked addresses.
    pub fn refcount(&self, phys: PhysAddr) -> Option<u16> {
        let index = self.index_of(phys)?;
        // SAFETY: in-bounds slot; shared read under the table lock.
        Some(unsafe { *self.count_slot(index) })
    }
}

static FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable::empty());

/// Initialize the global frame table for the buddy-managed region.
pub fn init(base: usize, size: usize) -> KernelResult<()> {
    let mut buddy = BUDDY.lock();
    FRAME_TABLE.lock().init(&mut buddy, base, size)
}

/// Allocate a page-aligned physical frame with reference count 1.
pub fn frame_alloc() -> KernelResult<PhysAddr> {
    let mut buddy = BUDDY.lock();
    FRAME_TABLE.lock().alloc(&mut buddy)
}

/// Increment the reference count of a mapped frame.
pub fn get_frame(phys: PhysAddr) {
    FRAME_TABLE.lock().get(phys)
}

/// Decrement the reference count; releases the frame to the buddy on the
/// transition to zero.
pub fn put_frame(phys: PhysAddr) {
    let mut buddy = BUDDY.lock();
    FRAME_TABLE.lock().put(&mut buddy, phys)
}

/// Release a 4 MiB large frame straight to the buddy (large pages carry
/// no per-frame counts).
pub fn free_large_frame(phys: PhysAddr) {
    BUDDY.lock().free(phys, crate::config::PAGE_SIZE_LARGE)
}

/// Bytes currently free in the physical allocator.
pub fn free_space() -> usize {
    BUDDY.lock().free_space()
}

/// Reference count of `phys`, or `None` if untracked.
pub fn refcount(phys: PhysAddr) -> Option<u16> {
    FRAME_TABLE.lock().refcount(phys)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::vec;

    use super::*;
    use crate::error::KernelError;

    fn arena(bytes: usize) -> (BuddyAllocator, FrameTable, usize) {
        let raw = vec![0u8; bytes + PAGE_SIZE].leak();
        let addr = raw.as_ptr() as usize;
        let base = (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let mut buddy = BuddyAllocator::empty();
        buddy.init(base, bytes).expect("buddy init");
        let mut table = FrameTable::empty();
        table
            .init(&mut buddy, base, bytes)
            .expect("frame table init");
        (buddy, table, base)
    }

    #[test]
    fn alloc_starts_at_one_and_put_releases() {
        let (mut buddy, mut table, _) = arena(1 << 18);
        let before = buddy.free_space();

        let frame = table.alloc(&mut buddy).expect("frame");
        assert_eq!(table.refcount(frame), Some(1));
        assert_eq!(buddy.free_space(), before - PAGE_SIZE);

        table.get(frame);
        assert_eq!(table.refcount(frame), Some(2));

        table.put(&mut buddy, frame);
        assert_eq!(table.refcount(frame), Some(1));
        assert_eq!(buddy.free_space(), before - PAGE_SIZE);

        table.put(&mut buddy, frame);
        assert_eq!(table.refcount(frame), Some(0));
        assert_eq!(buddy.free_space(), before);
    }

    #[test]
    fn untracked_addresses_are_count_infinity() {
        let (mut buddy, mut table, base) = arena(1 << 16);
        let mmio = PhysAddr::new(base.wrapping_add(1 << 30));
        assert_eq!(table.refcount(mmio), None);
        // Neither call may disturb the allocator
        let before = buddy.free_space();
        table.get(mmio);
        table.put(&mut buddy, mmio);
        assert_eq!(buddy.free_space(), before);
    }

    #[test]
    fn double_put_does_not_free_twice() {
        let (mut buddy, mut table, _) = arena(1 << 16);
        let frame = table.alloc(&mut buddy).expect("frame");
        table.put(&mut buddy, frame);
        let settled = buddy.free_space();
        table.put(&mut buddy, frame); // logged, ignored
        assert_eq!(buddy.free_space(), settled);
    }

    #[test]
    fn exhaustion_propagates() {
        let raw = vec![0u8; 3 * PAGE_SIZE].leak();
        let addr = raw.as_ptr() as usize;
        let base = (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let mut buddy = BuddyAllocator::empty();
        buddy.init(base, 2 * PAGE_SIZE).expect("buddy init");
        let mut table = FrameTable::empty();
        // The table itself consumes one page of the two
        table
            .init(&mut buddy, base, 2 * PAGE_SIZE)
            .expect("table init");
        table.alloc(&mut buddy).expect("last frame");
        assert_eq!(table.alloc(&mut buddy), Err(KernelError::OutOfFrames));
    }
}
