//! Per-process memory descriptor
//!
//! An [`AddressSpace`] owns one page-directory frame and an ordered set of
//! non-overlapping virtual memory areas with permission and growth
//! metadata. Page faults are resolved against the VMA set: grows-down
//! extension, on-demand materialization, or termination.
//!
//! The VMA set is a `BTreeMap` keyed by start address, which keeps the
//! sorted/disjoint invariant cheap to maintain and to check.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;

use bitflags::bitflags;

use super::paging::{self, PteFlags};
use super::{frame, page_align_down, page_align_up, PhysAddr, VirtAddr};
use crate::config::{KERNEL_VIRT_BASE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Semantic attributes of a virtual memory area
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const EXEC       = 1 << 2;
        const USER       = 1 << 3;
        const ANONYMOUS  = 1 << 4;
        const GROWS_DOWN = 1 << 5;
    }
}

/// One contiguous, permission-tagged region of user address space.
#[derive(Debug, Clone)]
pub struct Vma {
    /// Inclusive, page-aligned start
    pub start: usize,
    /// Exclusive, page-aligned end; `start == end` only for the heap
    /// placeholder before the first `brk`
    pub end: usize,
    pub flags: VmaFlags,
    /// PTE flags applied when a page of this area is materialized
    pub page_prot: PteFlags,
    /// Reserved for file-backed areas; the ELF loader pre-populates
    /// frames instead and leaves this empty
    pub file: Option<String>,
    pub file_offset: usize,
}

impl Vma {
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// How the faulting access was decoded from the error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    InstructionFetch,
}

/// Page-fault context relevant to VMA dispatch.
#[derive(Debug, Clone, Copy)]
pub struct FaultContext {
    pub access: FaultAccess,
    /// PTE-present bit of the error code (protection violation vs. absent)
    pub present: bool,
}

/// Decision taken for a fault, before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultResolution {
    /// Extend a grows-down VMA to `page` and materialize it
    ExtendStack { page: usize, prot: PteFlags },
    /// Materialize one zero-filled page of an existing VMA
    Materialize { page: usize, prot: PteFlags },
    /// Unrecoverable for this process
    Segv(&'static str),
}

/// Result of [`AddressSpace::handle_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping now exists; retry the faulting access
    Resolved,
    /// Segmentation violation; the process must be terminated
    Segv(&'static str),
}

/// Per-process memory descriptor: one page directory plus the VMA set and
/// the program-break bounds.
pub struct AddressSpace {
    pd_phys: PhysAddr,
    vmas: BTreeMap<usize, Vma>,
    pub start_brk: usize,
    pub end_brk: usize,
}

impl AddressSpace {
    /// Bind a descriptor to an existing page directory.
    pub fn new(pd_phys: PhysAddr) -> Self {
        Self {
            pd_phys,
            vmas: BTreeMap::new(),
            start_brk: 0,
            end_brk: 0,
        }
    }

    pub fn page_directory(&self) -> PhysAddr {
        self.pd_phys
    }

    /// Insert `[start, end)` keeping the set sorted and disjoint.
    ///
    /// `start == end` inserts the zero-size heap placeholder. Fails on
    /// overlap, misalignment, inverted bounds, or a span reaching kernel
    /// space.
    pub fn insert_vma(
        &mut self,
        start: usize,
        end: usize,
        flags: VmaFlags,
        page_prot: PteFlags,
        file: Option<String>,
        file_offset: usize,
    ) -> KernelResult<()> {
        if start % PAGE_SIZE != 0 {
            return Err(KernelError::BadAlignment { addr: start });
        }
        if end % PAGE_SIZE != 0 {
            return Err(KernelError::BadAlignment { addr: end });
        }
        if end < start {
            return Err(KernelError::VmaOverlap { start, end });
        }
        if end > KERNEL_VIRT_BASE {
            return Err(KernelError::KernelSpaceViolation { addr: end });
        }

        if let Some((_, prev)) = self.vmas.range(..=start).next_back() {
            if prev.end > start || prev.start == start {
                return Err(KernelError::VmaOverlap { start, end });
            }
        }
        if let Some((&next_start, _)) = self.vmas.range(start + 1..).next() {
            if next_start < end {
                return Err(KernelError::VmaOverlap { start, end });
            }
        }

        self.vmas.insert(
            start,
            Vma {
                start,
                end,
                flags,
                page_prot,
                file,
                file_offset,
            },
        );
        Ok(())
    }

    /// The VMA containing `addr`, if any.
    pub fn find_vma(&self, addr: usize) -> Option<&Vma> {
        self.vmas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.contains(addr))
    }

    /// Iterate areas in ascending start order.
    pub fn vmas(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.values()
    }

    /// Dispatch a fault at `addr` per the on-demand policy. Pure decision;
    /// side effects happen in [`handle_fault`].
    pub(crate) fn classify_fault(&self, addr: usize, ctx: FaultContext) -> FaultResolution {
        let page = page_align_down(addr);

        let Some(vma) = self.find_vma(addr) else {
            // A grows-down area may claim the page immediately below its
            // current start.
            if let Some(above) = self.vmas.get(&(page + PAGE_SIZE)) {
                if above.flags.contains(VmaFlags::GROWS_DOWN) {
                    return FaultResolution::ExtendStack {
                        page,
                        prot: above.page_prot,
                    };
                }
            }
            return FaultResolution::Segv("no VMA covers the faulting address");
        };

        let allowed = match ctx.access {
            FaultAccess::Read => vma.flags.contains(VmaFlags::READ),
            FaultAccess::Write => vma.flags.contains(VmaFlags::WRITE),
            FaultAccess::InstructionFetch => vma.flags.contains(VmaFlags::EXEC),
        };
        if !allowed {
            return FaultResolution::Segv("access violates VMA permissions");
        }

        if !ctx.present {
            // Absent PTE inside a valid area: demand-materialize.
            return FaultResolution::Materialize {
                page,
                prot: vma.page_prot,
            };
        }

        // Present PTE: a write to a page mapped read-only is recoverable
        // when the area itself permits writing.
        if ctx.access == FaultAccess::Write && vma.flags.contains(VmaFlags::WRITE) {
            return FaultResolution::Materialize {
                page,
                prot: vma.page_prot,
            };
        }

        FaultResolution::Segv("protection violation inside a VMA")
    }

    /// Resolve a fault: allocate and map a zero frame, extending the VMA
    /// first for grows-down areas. Errors are resource exhaustion only.
    pub fn handle_fault(&mut self, addr: usize, ctx: FaultContext) -> KernelResult<FaultOutcome> {
        match self.classify_fault(addr, ctx) {
            FaultResolution::Segv(reason) => Ok(FaultOutcome::Segv(reason)),
            FaultResolution::Materialize { page, prot } => {
                self.materialize_page(page, prot)?;
                Ok(FaultOutcome::Resolved)
            }
            FaultResolution::ExtendStack { page, prot } => {
                let old_start = page + PAGE_SIZE;
                let mut vma = self
                    .vmas
                    .remove(&old_start)
                    .expect("classified stack VMA vanished");
                vma.start = page;
                self.vmas.insert(page, vma);

                if let Err(err) = self.materialize_page(page, prot) {
                    // Roll the extension back so the set stays truthful
                    let mut vma = self.vmas.remove(&page).expect("VMA just inserted");
                    vma.start = old_start;
                    self.vmas.insert(old_start, vma);
                    return Err(err);
                }
                log::debug!(
                    target: "mm",
                    "grew stack VMA down to {:#010x}",
                    page
                );
                Ok(FaultOutcome::Resolved)
            }
        }
    }

    fn materialize_page(&mut self, page: usize, prot: PteFlags) -> KernelResult<()> {
        let frame = frame::frame_alloc()?;
        paging::zero_frame(frame);
        if let Err(err) =
            paging::map_single_4k(self.pd_phys, VirtAddr::new(page), frame, prot)
        {
            frame::put_frame(frame);
            return Err(err);
        }
        Ok(())
    }

    /// Move the program break. Growing extends the heap VMA (demand-paged,
    /// nothing is mapped eagerly); shrinking unmaps the vacated pages.
    pub fn set_brk(&mut self, new_brk: usize) -> KernelResult<usize> {
        if new_brk < self.start_brk {
            return Err(KernelError::InvalidArgument {
                name: "brk",
                value: new_brk,
            });
        }
        let old_end = page_align_up(self.end_brk);
        let new_end = page_align_up(new_brk);
        if new_end > KERNEL_VIRT_BASE {
            return Err(KernelError::KernelSpaceViolation { addr: new_end });
        }

        let heap_start = self.start_brk;
        if new_end > old_end {
            if let Some((&next_start, _)) = self.vmas.range(heap_start + 1..).next() {
                if next_start < new_end {
                    return Err(KernelError::VmaOverlap {
                        start: heap_start,
                        end: new_end,
                    });
                }
            }
        }

        let vma = self
            .vmas
            .get_mut(&page_align_down(heap_start))
            .ok_or(KernelError::NotMapped { addr: heap_start })?;
        vma.end = new_end;

        if new_end < old_end {
            paging::unmap_range(
                self.pd_phys,
                VirtAddr::new(new_end),
                (old_end - new_end) / PAGE_SIZE,
            );
        }

        self.end_brk = new_brk;
        Ok(new_brk)
    }

    /// Release every user mapping and the VMA list. The page-directory
    /// frame itself stays alive: the PCB owns it and frees it last.
    pub fn destroy(mut self) {
        paging::free_user_space(self.pd_phys);
        self.vmas.clear();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::config::{USER_STACK_BOTTOM_VIRT, USER_STACK_TOP_VIRT};

    fn space() -> AddressSpace {
        AddressSpace::new(PhysAddr::new(0x1000))
    }

    fn user_rw() -> (VmaFlags, PteFlags) {
        (
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER | VmaFlags::ANONYMOUS,
            PteFlags::user_data(),
        )
    }

    #[test]
    fn inserts_stay_sorted_and_disjoint() {
        let mut mm = space();
        let (flags, prot) = user_rw();
        mm.insert_vma(0x3000, 0x5000, flags, prot, None, 0).unwrap();
        mm.insert_vma(0x1000, 0x2000, flags, prot, None, 0).unwrap();
        mm.insert_vma(0x6000, 0x8000, flags, prot, None, 0).unwrap();

        let starts: alloc::vec::Vec<usize> = mm.vmas().map(|v| v.start).collect();
        assert_eq!(starts, [0x1000, 0x3000, 0x6000]);
        for pair in starts.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn overlap_and_kernel_space_are_rejected() {
        let mut mm = space();
        let (flags, prot) = user_rw();
        mm.insert_vma(0x3000, 0x5000, flags, prot, None, 0).unwrap();

        assert_eq!(
            mm.insert_vma(0x4000, 0x6000, flags, prot, None, 0),
            Err(KernelError::VmaOverlap {
                start: 0x4000,
                end: 0x6000
            })
        );
        assert_eq!(
            mm.insert_vma(0x2000, 0x4000, flags, prot, None, 0),
            Err(KernelError::VmaOverlap {
                start: 0x2000,
                end: 0x4000
            })
        );
        assert!(matches!(
            mm.insert_vma(
                KERNEL_VIRT_BASE - 0x1000,
                KERNEL_VIRT_BASE + 0x1000,
                flags,
                prot,
                None,
                0
            ),
            Err(KernelError::KernelSpaceViolation { .. })
        ));
        assert_eq!(
            mm.insert_vma(0x3000, 0x3000, flags, prot, None, 0),
            Err(KernelError::VmaOverlap {
                start: 0x3000,
                end: 0x3000
            })
        );
    }

    #[test]
    fn find_vma_honors_half_open_bounds() {
        let mut mm = space();
        let (flags, prot) = user_rw();
        mm.insert_vma(0x3000, 0x5000, flags, prot, None, 0).unwrap();

        assert!(mm.find_vma(0x2FFF).is_none());
        assert_eq!(mm.find_vma(0x3000).unwrap().start, 0x3000);
        assert_eq!(mm.find_vma(0x4FFF).unwrap().start, 0x3000);
        assert!(mm.find_vma(0x5000).is_none());
    }

    #[test]
    fn fault_classification_matches_the_dispatch_table() {
        let mut mm = space();
        let (flags, prot) = user_rw();
        // A read-only code-like area
        mm.insert_vma(
            0x0804_8000,
            0x0804_A000,
            VmaFlags::READ | VmaFlags::EXEC | VmaFlags::USER,
            PteFlags::PRESENT | PteFlags::USER,
            None,
            0,
        )
        .unwrap();
        // The grows-down stack
        mm.insert_vma(
            USER_STACK_BOTTOM_VIRT,
            USER_STACK_TOP_VIRT,
            flags | VmaFlags::GROWS_DOWN,
            prot,
            None,
            0,
        )
        .unwrap();

        let read_absent = FaultContext {
            access: FaultAccess::Read,
            present: false,
        };
        let write_absent = FaultContext {
            access: FaultAccess::Write,
            present: false,
        };
        let write_present = FaultContext {
            access: FaultAccess::Write,
            present: true,
        };

        // 1. No VMA at all -> segv
        assert!(matches!(
            mm.classify_fault(0x100, read_absent),
            FaultResolution::Segv(_)
        ));

        // 2. Page immediately below a grows-down start -> extension
        assert_eq!(
            mm.classify_fault(USER_STACK_BOTTOM_VIRT - 0x1000, write_absent),
            FaultResolution::ExtendStack {
                page: USER_STACK_BOTTOM_VIRT - 0x1000,
                prot
            }
        );
        // ...but two pages below is a plain segv
        assert!(matches!(
            mm.classify_fault(USER_STACK_BOTTOM_VIRT - 0x2000, write_absent),
            FaultResolution::Segv(_)
        ));

        // 3. Absent page inside a writable area -> materialize
        assert_eq!(
            mm.classify_fault(USER_STACK_BOTTOM_VIRT + 0x1000, write_absent),
            FaultResolution::Materialize {
                page: USER_STACK_BOTTOM_VIRT + 0x1000,
                prot
            }
        );

        // 3b. Write to a present read-only page of a writable area
        assert!(matches!(
            mm.classify_fault(USER_STACK_BOTTOM_VIRT + 0x1000, write_present),
            FaultResolution::Materialize { .. }
        ));

        // 4. Write into the read-only code area -> segv
        assert!(matches!(
            mm.classify_fault(0x0804_8010, write_absent),
            FaultResolution::Segv(_)
        ));
        // Instruction fetch from the code area is fine (absent -> demand)
        assert!(matches!(
            mm.classify_fault(
                0x0804_8010,
                FaultContext {
                    access: FaultAccess::InstructionFetch,
                    present: false
                }
            ),
            FaultResolution::Materialize { .. }
        ));
    }

    #[test]
    fn brk_rules() {
        let mut mm = space();
        let (flags, prot) = user_rw();
        mm.start_brk = 0x0804_A000;
        mm.end_brk = 0x0804_A000;
        mm.insert_vma(0x0804_A000, 0x0804_A000, flags, prot, None, 0)
            .unwrap();
        // A mapping sitting above the heap bounds growth
        mm.insert_vma(0x0805_0000, 0x0805_2000, flags, prot, None, 0)
            .unwrap();

        assert_eq!(mm.set_brk(0x0804_C800), Ok(0x0804_C800));
        assert_eq!(mm.find_vma(0x0804_C000).unwrap().start, 0x0804_A000);
        assert_eq!(mm.end_brk, 0x0804_C800);

        // Below start_brk: rejected
        assert!(mm.set_brk(0x0804_9000).is_err());
        // Into the next VMA: rejected
        assert!(mm.set_brk(0x0805_1000).is_err());
    }
}
