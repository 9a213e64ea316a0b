//! 32-bit non-PAE paging engine
//!
//! Owns page-directory and page-table manipulation: the recursive
//! self-map, the temporary single-page kernel mapping, range map/unmap,
//! virtual-to-physical lookup, address-space cloning and user-space
//! teardown.
//!
//! Structure edits never go through ad-hoc pointers: before activation the
//! boot identity window is used; afterwards every page-directory or
//! page-table frame is reached through the scoped [`TempMapping`] slot,
//! whose own PTE is edited through the recursive window shared by all
//! address spaces.

use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard, Once};

use super::{frame, phys_to_virt, PhysAddr, VirtAddr};
use crate::arch::x86::cpu;
use crate::config::{
    ENTRIES_PER_TABLE, KERNEL_PDE_INDEX, KERNEL_STACK_VIRT_START, KERNEL_VIRT_BASE, PAGE_SIZE,
    PAGE_SIZE_LARGE, PAGING_TEMP_VADDR, RECURSIVE_PDE_INDEX, RECURSIVE_PT_WINDOW,
};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// PTE/PDE flag bits (low 12 bits of an entry)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Page-size bit: in a PDE, maps a 4 MiB region
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
        /// Software no-execute intent (bit 9, OS-available)
        const SOFT_NX       = 1 << 9;
        const SOFT_AVL2     = 1 << 10;
        const SOFT_AVL3     = 1 << 11;
    }
}

impl PteFlags {
    /// Kernel read/write data, no execute
    pub fn kernel_data() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::SOFT_NX
    }

    /// Kernel read/write/execute (boot image map)
    pub fn kernel_code() -> Self {
        Self::PRESENT | Self::WRITABLE
    }

    /// User read/write data, no execute
    pub fn user_data() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::USER | Self::SOFT_NX
    }
}

/// Upper 20 bits of a 4 KiB entry are the physical frame number
pub const PTE_ADDR_MASK: u32 = 0xFFFF_F000;
/// Upper 10 bits of a 4 MiB PDE are the large-frame number
pub const PDE_LARGE_ADDR_MASK: u32 = 0xFFC0_0000;

/// PDE flags legal to derive from a PTE flag set
pub fn pde_flags_from_pte(flags: PteFlags) -> PteFlags {
    flags
        & (PteFlags::PRESENT
            | PteFlags::WRITABLE
            | PteFlags::USER
            | PteFlags::WRITE_THROUGH
            | PteFlags::NO_CACHE)
}

/// Index of the PDE covering `vaddr` (bits 22..32)
pub const fn pde_index(vaddr: usize) -> usize {
    (vaddr >> 22) & 0x3FF
}

/// Index of the PTE covering `vaddr` (bits 12..22)
pub const fn pte_index(vaddr: usize) -> usize {
    (vaddr >> 12) & 0x3FF
}

/// One page-directory or page-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(phys: PhysAddr, flags: PteFlags) -> Self {
        debug_assert!(phys.is_page_aligned());
        Self((phys.as_usize() as u32 & PTE_ADDR_MASK) | flags.bits())
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub const fn is_large(&self) -> bool {
        self.0 & PteFlags::LARGE.bits() != 0
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Physical address of the referenced 4 KiB frame or page table
    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::new((self.0 & PTE_ADDR_MASK) as usize)
    }

    /// Physical base of the referenced 4 MiB frame
    pub const fn large_addr(&self) -> PhysAddr {
        PhysAddr::new((self.0 & PDE_LARGE_ADDR_MASK) as usize)
    }
}

/// A page table or page directory: 1024 32-bit entries
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub fn zero(&mut self) {
        self.entries = [Entry::empty(); ENTRIES_PER_TABLE];
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = Entry;

    fn index(&self, index: usize) -> &Entry {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Entry {
        &mut self.entries[index]
    }
}

// ---------------------------------------------------------------------------
// Global paging state
// ---------------------------------------------------------------------------

/// Physical address of the canonical kernel page directory
static KERNEL_PD: Once<PhysAddr> = Once::new();

/// CR3 value last loaded through [`activate`] (diagnostics)
static CURRENT_PD: AtomicUsize = AtomicUsize::new(0);

/// True once `activate` has run and structure edits must use the temp slot
static PAGING_ACTIVE: AtomicUsize = AtomicUsize::new(0);

/// The canonical kernel page directory.
///
/// # Panics
///
/// If read before [`initialize_directory`] has built it.
pub fn kernel_directory() -> PhysAddr {
    *KERNEL_PD
        .get()
        .expect("kernel page directory read before initialization")
}

/// Physical address of the last directory handed to [`activate`]
pub fn current_directory() -> PhysAddr {
    PhysAddr::new(CURRENT_PD.load(Ordering::Acquire))
}

// ---------------------------------------------------------------------------
// Temporary mapping slot
// ---------------------------------------------------------------------------

/// Virtual address of the temp slot's own PTE, through the recursive window
const TEMP_PTE_VADDR: usize =
    RECURSIVE_PT_WINDOW + pde_index(PAGING_TEMP_VADDR) * PAGE_SIZE + pte_index(PAGING_TEMP_VADDR) * 4;

struct TempSlot;

static TEMP_SLOT: Mutex<TempSlot> = Mutex::new(TempSlot);

/// Scoped kernel mapping of one arbitrary physical frame at
/// [`PAGING_TEMP_VADDR`].
///
/// Acquisition takes the single slot; dropping the guard clears the PTE
/// and invalidates the TLB entry. Nesting is a programming error and
/// panics instead of deadlocking.
pub struct TempMapping {
    _slot: MutexGuard<'static, TempSlot>,
}

impl TempMapping {
    pub fn map(phys: PhysAddr) -> Self {
        debug_assert!(phys.is_page_aligned());
        let slot = TEMP_SLOT
            .try_lock()
            .expect("temporary mapping slot is not reentrant");
        let entry = Entry::new(phys, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::SOFT_NX);
        // SAFETY: TEMP_PTE_VADDR is the temp slot's PTE inside the
        // recursive window; PT 1022 is pre-seeded in the kernel directory
        // and shared (via the kernel-PDE copy) by every address space.
        unsafe {
            core::ptr::write_volatile(TEMP_PTE_VADDR as *mut u32, entry.raw());
        }
        cpu::invlpg(PAGING_TEMP_VADDR);
        Self { _slot: slot }
    }

    pub fn ptr(&self) -> *mut u8 {
        PAGING_TEMP_VADDR as *mut u8
    }

    /// View the mapped frame as a page table.
    ///
    /// # Safety
    ///
    /// The mapped frame must actually hold a page table or be in the
    /// process of becoming one (zeroing).
    pub unsafe fn as_table(&self) -> &mut PageTable {
        // SAFETY: the slot maps a full, exclusive 4 KiB frame for the
        // guard's lifetime; alignment matches the slot address.
        unsafe { &mut *(PAGING_TEMP_VADDR as *mut PageTable) }
    }
}

impl Drop for TempMapping {
    fn drop(&mut self) {
        // SAFETY: same mapping the guard created.
        unsafe {
            core::ptr::write_volatile(TEMP_PTE_VADDR as *mut u32, 0);
        }
        cpu::invlpg(PAGING_TEMP_VADDR);
    }
}

/// Read or edit the page table / directory stored in `phys`.
///
/// Before activation the frame is addressed through the boot identity
/// window; afterwards through the temp slot.
fn with_table<R>(phys: PhysAddr, f: impl FnOnce(&mut PageTable) -> R) -> R {
    if PAGING_ACTIVE.load(Ordering::Acquire) == 0 {
        // SAFETY: pre-activation, physical memory is identity-addressable
        // and the boot path is single-threaded.
        let table = unsafe { &mut *(phys_to_virt(phys) as *mut PageTable) };
        f(table)
    } else {
        let mapping = TempMapping::map(phys);
        // SAFETY: every caller passes a PD or PT frame.
        f(unsafe { mapping.as_table() })
    }
}

/// Zero a freshly allocated frame through the temp slot.
pub fn zero_frame(phys: PhysAddr) {
    with_table(phys, |table| table.zero());
}

// ---------------------------------------------------------------------------
// TLB and CR3
// ---------------------------------------------------------------------------

/// Invalidate the TLB entry for one page
pub fn invalidate_page(vaddr: VirtAddr) {
    cpu::invlpg(vaddr.as_usize());
}

/// Invalidate `npages` consecutive pages
pub fn flush_range(vaddr: VirtAddr, npages: usize) {
    for i in 0..npages {
        cpu::invlpg(vaddr.as_usize() + i * PAGE_SIZE);
    }
}

/// Load CR3 with `pd_phys`.
///
/// # Safety
///
/// `pd_phys` must be a fully formed page directory (kernel half + recursive
/// entry), and the caller must have interrupts disabled for the duration.
pub unsafe fn activate(pd_phys: PhysAddr) {
    // SAFETY: contract forwarded to the caller.
    unsafe { cpu::write_cr3(pd_phys.as_usize()) };
    CURRENT_PD.store(pd_phys.as_usize(), Ordering::Release);
    PAGING_ACTIVE.store(1, Ordering::Release);
}

// ---------------------------------------------------------------------------
// Mapping primitives
// ---------------------------------------------------------------------------

/// Map one 4 KiB page `virt` → `phys` in the directory at `pd_phys`.
///
/// Allocates (and zeroes) the page table if the covering PDE is absent,
/// deriving the PDE flags from `flags`. If the PTE was already present
/// with a different frame, the previous frame's reference is dropped.
/// Always ends with a TLB invalidation of `virt`.
pub fn map_single_4k(
    pd_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PteFlags,
) -> KernelResult<()> {
    if !virt.is_page_aligned() {
        return Err(KernelError::BadAlignment {
            addr: virt.as_usize(),
        });
    }
    if !phys.is_page_aligned() {
        return Err(KernelError::BadAlignment {
            addr: phys.as_usize(),
        });
    }
    if flags.contains(PteFlags::USER) && virt.as_usize() >= KERNEL_VIRT_BASE {
        return Err(KernelError::KernelSpaceViolation {
            addr: virt.as_usize(),
        });
    }

    let pdi = pde_index(virt.as_usize());
    let pde = with_table(pd_phys, |pd| pd[pdi]);

    let pt_phys = if pde.is_present() {
        if pde.is_large() {
            return Err(KernelError::InvalidArgument {
                name: "vaddr",
                value: virt.as_usize(),
            });
        }
        pde.addr()
    } else {
        let pt = frame::frame_alloc()?;
        zero_frame(pt);
        let pde_flags =
            pde_flags_from_pte(flags) | PteFlags::PRESENT | PteFlags::WRITABLE;
        with_table(pd_phys, |pd| pd[pdi] = Entry::new(pt, pde_flags));
        pt
    };

    let pti = pte_index(virt.as_usize());
    let previous = with_table(pt_phys, |table| {
        let old = table[pti];
        table[pti] = Entry::new(phys, flags | PteFlags::PRESENT);
        old
    });

    if previous.is_present() && previous.addr() != phys {
        frame::put_frame(previous.addr());
    }

    invalidate_page(virt);
    Ok(())
}

/// Map `npages` consecutive pages. On partial failure every page mapped by
/// this call is unmapped again (releasing the frame references it took
/// over) before the error propagates.
pub fn map_range(
    pd_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    npages: usize,
    flags: PteFlags,
) -> KernelResult<()> {
    for i in 0..npages {
        let v = VirtAddr::new(virt.as_usize() + i * PAGE_SIZE);
        let p = PhysAddr::new(phys.as_usize() + i * PAGE_SIZE);
        if let Err(err) = map_single_4k(pd_phys, v, p, flags) {
            unmap_range(pd_phys, virt, i);
            return Err(err);
        }
    }
    Ok(())
}

/// Clear the PTEs for `npages` pages starting at `virt`, dropping one
/// frame reference per formerly mapped page and invalidating each page.
/// Absent PDEs/PTEs are silently skipped.
pub fn unmap_range(pd_phys: PhysAddr, virt: VirtAddr, npages: usize) {
    for i in 0..npages {
        let v = virt.as_usize() + i * PAGE_SIZE;
        let pde = with_table(pd_phys, |pd| pd[pde_index(v)]);
        if !pde.is_present() || pde.is_large() {
            continue;
        }
        let freed = with_table(pde.addr(), |table| {
            let old = table[pte_index(v)];
            table[pte_index(v)] = Entry::empty();
            old
        });
        if freed.is_present() {
            frame::put_frame(freed.addr());
        }
        invalidate_page(VirtAddr::new(v));
    }
}

/// Walk the two paging levels and return the physical address backing
/// `virt`, honoring 4 MiB PDEs.
pub fn get_physical_address(pd_phys: PhysAddr, virt: VirtAddr) -> KernelResult<PhysAddr> {
    let v = virt.as_usize();
    let pde = with_table(pd_phys, |pd| pd[pde_index(v)]);
    if !pde.is_present() {
        return Err(KernelError::NotMapped { addr: v });
    }
    if pde.is_large() {
        return Ok(PhysAddr::new(
            pde.large_addr().as_usize() + (v & (PAGE_SIZE_LARGE - 1)),
        ));
    }
    let pte = with_table(pde.addr(), |table| table[pte_index(v)]);
    if !pte.is_present() {
        return Err(KernelError::NotMapped { addr: v });
    }
    Ok(PhysAddr::new(pte.addr().as_usize() + (v & (PAGE_SIZE - 1))))
}

// ---------------------------------------------------------------------------
// Directory lifecycle
// ---------------------------------------------------------------------------

/// Number of kernel-space PDE slots copied verbatim into new directories
/// (indices `KERNEL_PDE_INDEX..RECURSIVE_PDE_INDEX`; the recursive slot is
/// always freshly written).
const KERNEL_PDE_COPY: usize = RECURSIVE_PDE_INDEX - KERNEL_PDE_INDEX;

/// Build the canonical kernel page directory.
///
/// Maps physical memory `[0, mapping_limit)` both at identity and at the
/// higher half (4 MiB pages when PSE is available), pre-seeds the page
/// tables backing the temp slot and the first kernel-stack chunk, and
/// installs the recursive self-map. Returns the directory's kernel
/// virtual address (through the current physical window) alongside its
/// physical address.
///
/// Call once, before paging is enabled.
pub fn initialize_directory(mapping_limit: usize) -> KernelResult<(VirtAddr, PhysAddr)> {
    let limit = mapping_limit.max(16 * 1024 * 1024);
    let chunks = limit.div_ceil(PAGE_SIZE_LARGE);
    if KERNEL_PDE_INDEX + chunks >= pde_index(KERNEL_STACK_VIRT_START) {
        return Err(KernelError::InvalidArgument {
            name: "mapping_limit",
            value: mapping_limit,
        });
    }

    let pd = frame::frame_alloc()?;
    zero_frame(pd);

    let pse = cpu::features().pse;
    for chunk in 0..chunks {
        let base = PhysAddr::new(chunk * PAGE_SIZE_LARGE);
        let entry = if pse {
            Entry::new(base, PteFlags::kernel_code() | PteFlags::LARGE)
        } else {
            let pt = frame::frame_alloc()?;
            with_table(pt, |table| {
                for i in 0..ENTRIES_PER_TABLE {
                    table[i] = Entry::new(
                        PhysAddr::new(base.as_usize() + i * PAGE_SIZE),
                        PteFlags::kernel_code(),
                    );
                }
            });
            Entry::new(pt, PteFlags::PRESENT | PteFlags::WRITABLE)
        };
        with_table(pd, |dir| {
            // Shared by the identity and higher-half windows
            dir[chunk] = entry;
            dir[KERNEL_PDE_INDEX + chunk] = entry;
        });
    }

    // Pre-seed the page table that backs the temp slot, and the first
    // kernel-stack table, so both land in every process's kernel-PDE copy.
    for pdi in [pde_index(PAGING_TEMP_VADDR), pde_index(KERNEL_STACK_VIRT_START)] {
        let pt = frame::frame_alloc()?;
        zero_frame(pt);
        with_table(pd, |dir| {
            dir[pdi] = Entry::new(pt, PteFlags::PRESENT | PteFlags::WRITABLE);
        });
    }

    with_table(pd, |dir| {
        dir[RECURSIVE_PDE_INDEX] =
            Entry::new(pd, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::SOFT_NX);
    });

    KERNEL_PD.call_once(|| pd);
    log::info!(
        target: "paging",
        "kernel directory at {:#010x}, {} MiB mapped, pse={}",
        pd.as_usize(),
        limit / (1024 * 1024),
        pse
    );
    Ok((VirtAddr::new(phys_to_virt(pd) as usize), pd))
}

/// Clone the kernel half of `src_pd_phys` into a fresh directory: kernel
/// PDEs copied verbatim, user PDEs zeroed, recursive slot pointing at the
/// new directory. This is the skeleton a new address space starts from.
pub fn clone_directory(src_pd_phys: PhysAddr) -> KernelResult<PhysAddr> {
    let new_pd = frame::frame_alloc()?;

    let mut kernel_entries = [Entry::empty(); KERNEL_PDE_COPY];
    with_table(src_pd_phys, |src| {
        for (i, slot) in kernel_entries.iter_mut().enumerate() {
            *slot = src[KERNEL_PDE_INDEX + i];
        }
    });

    with_table(new_pd, |dst| {
        dst.zero();
        for (i, entry) in kernel_entries.iter().enumerate() {
            dst[KERNEL_PDE_INDEX + i] = *entry;
        }
        dst[RECURSIVE_PDE_INDEX] =
            Entry::new(new_pd, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::SOFT_NX);
    });

    Ok(new_pd)
}

/// Tear down every user-space mapping in `pd_phys`: drop one reference per
/// mapped frame, free each 4 KiB page table, release 4 MiB frames whole,
/// and clear the PDEs. Kernel-space slots are untouched.
pub fn free_user_space(pd_phys: PhysAddr) {
    for pdi in 0..KERNEL_PDE_INDEX {
        let pde = with_table(pd_phys, |pd| pd[pdi]);
        if !pde.is_present() {
            continue;
        }

        if pde.is_large() {
            frame::free_large_frame(pde.large_addr());
        } else {
            let pt_phys = pde.addr();
            with_table(pt_phys, |table| {
                for i in 0..ENTRIES_PER_TABLE {
                    let pte = table[i];
                    if pte.is_present() {
                        frame::put_frame(pte.addr());
                        table[i] = Entry::empty();
                    }
                }
            });
            frame::put_frame(pt_phys);
        }

        with_table(pd_phys, |pd| pd[pdi] = Entry::empty());
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::config::RECURSIVE_PD_VADDR;

    #[test]
    fn index_math_matches_the_architecture() {
        assert_eq!(pde_index(0xC000_0000), 768);
        assert_eq!(pde_index(0xFFBF_F000), 1022);
        assert_eq!(pte_index(0xFFBF_F000), 1023);
        assert_eq!(pde_index(RECURSIVE_PD_VADDR), 1023);
        assert_eq!(pte_index(RECURSIVE_PD_VADDR), 1023);
        assert_eq!(pde_index(0x0804_8000), 32);
        assert_eq!(pte_index(0x0804_8000), 72);
    }

    #[test]
    fn temp_pte_sits_in_the_recursive_window() {
        assert_eq!(TEMP_PTE_VADDR, 0xFFC0_0000 + 1022 * 4096 + 1023 * 4);
    }

    #[test]
    fn entries_roundtrip_address_and_flags() {
        let entry = Entry::new(PhysAddr::new(0x0040_0000), PteFlags::user_data());
        assert!(entry.is_present());
        assert!(!entry.is_large());
        assert_eq!(entry.addr(), PhysAddr::new(0x0040_0000));
        assert!(entry.flags().contains(PteFlags::USER | PteFlags::SOFT_NX));

        let large = Entry::new(
            PhysAddr::new(0x0080_0000),
            PteFlags::kernel_code() | PteFlags::LARGE,
        );
        assert!(large.is_large());
        assert_eq!(large.large_addr(), PhysAddr::new(0x0080_0000));
    }

    #[test]
    fn pde_flags_keep_only_architectural_bits() {
        let derived = pde_flags_from_pte(PteFlags::user_data());
        assert_eq!(
            derived,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER
        );
        // The software NX marker never propagates into a PDE
        assert!(!derived.contains(PteFlags::SOFT_NX));
    }

    #[test]
    fn page_table_type_is_exactly_one_frame() {
        assert_eq!(core::mem::size_of::<PageTable>(), PAGE_SIZE);
        assert_eq!(core::mem::align_of::<PageTable>(), PAGE_SIZE);
    }
}
