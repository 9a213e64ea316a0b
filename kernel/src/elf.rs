//! ELF32 program loader
//!
//! Validates an ELF32 little-endian i386 executable, creates one VMA per
//! `PT_LOAD` segment, then allocates, populates and maps a frame for every
//! page of every segment. Frames are populated through the temporary
//! kernel mapping; BSS space is zero-filled. Reports the entry point and
//! the initial program break.
//!
//! Validation and geometry are pure functions over the file bytes so they
//! are unit-tested on the host; only the populate/map loop touches frames
//! and page tables.

extern crate alloc;

use crate::config::{KERNEL_VIRT_BASE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::address_space::{AddressSpace, VmaFlags};
use crate::mm::paging::{self, PteFlags, TempMapping};
use crate::mm::{frame, page_align_up, PhysAddr, VirtAddr};

/// ELF identification indexes / values
const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u32 = 1;

const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;

const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// What the loader reports back to process construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadInfo {
    pub entry_point: u32,
    /// Page-aligned end of the highest loaded segment
    pub initial_brk: u32,
}

/// Validated per-segment geometry, ready to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    /// Page-aligned VMA span
    pub vm_start: u32,
    pub vm_end: u32,
    pub vma_flags: VmaFlags,
    pub page_prot: PteFlags,
    pub vaddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub offset: u32,
}

/// Parse and validate the file header.
pub fn parse_header(data: &[u8]) -> KernelResult<Elf32Header> {
    if data.len() < core::mem::size_of::<Elf32Header>() {
        return Err(KernelError::InvalidExecutable {
            reason: "file smaller than the ELF header",
        });
    }
    // SAFETY: length checked; read_unaligned copies out of the byte
    // buffer regardless of its alignment.
    let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf32Header) };

    if header.e_ident[..4] != ELFMAG {
        return Err(KernelError::InvalidExecutable {
            reason: "bad ELF magic",
        });
    }
    if header.e_ident[EI_CLASS] != ELFCLASS32 {
        return Err(KernelError::InvalidExecutable {
            reason: "not a 32-bit ELF",
        });
    }
    if header.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(KernelError::InvalidExecutable {
            reason: "not little-endian",
        });
    }
    if header.e_ident[EI_VERSION] as u32 != EV_CURRENT || header.e_version != EV_CURRENT {
        return Err(KernelError::InvalidExecutable {
            reason: "unsupported ELF version",
        });
    }
    if header.e_type != ET_EXEC {
        return Err(KernelError::InvalidExecutable {
            reason: "not an executable (ET_EXEC)",
        });
    }
    if header.e_machine != EM_386 {
        return Err(KernelError::InvalidExecutable {
            reason: "not an i386 executable",
        });
    }
    if header.e_phentsize as usize != core::mem::size_of::<Elf32ProgramHeader>() {
        return Err(KernelError::InvalidExecutable {
            reason: "unexpected program-header entry size",
        });
    }
    if header.e_phoff == 0 || header.e_phnum == 0 {
        return Err(KernelError::InvalidExecutable {
            reason: "no program headers",
        });
    }
    let table_end =
        header.e_phoff as u64 + header.e_phnum as u64 * header.e_phentsize as u64;
    if table_end > data.len() as u64 {
        return Err(KernelError::InvalidExecutable {
            reason: "program headers out of bounds",
        });
    }
    if header.e_entry == 0 {
        return Err(KernelError::InvalidExecutable {
            reason: "zero entry point",
        });
    }
    if header.e_entry as usize >= KERNEL_VIRT_BASE {
        log::warn!(
            target: "elf",
            "entry point {:#010x} lies in kernel space",
            header.e_entry
        );
        return Err(KernelError::InvalidExecutable {
            reason: "entry point in kernel space",
        });
    }
    Ok(header)
}

/// Program header `index` of a validated file.
pub fn program_header(data: &[u8], header: &Elf32Header, index: u16) -> Elf32ProgramHeader {
    let offset = header.e_phoff as usize + index as usize * header.e_phentsize as usize;
    // SAFETY: `parse_header` bounds-checked the whole table.
    unsafe {
        core::ptr::read_unaligned(data.as_ptr().add(offset) as *const Elf32ProgramHeader)
    }
}

/// Validate one program header and derive its mapping geometry.
///
/// Returns `Ok(None)` for segments the loader ignores (non-`PT_LOAD`,
/// or `memsz == 0`).
pub fn plan_segment(
    ph: &Elf32ProgramHeader,
    file_len: usize,
    nx_supported: bool,
) -> KernelResult<Option<SegmentPlan>> {
    if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
        return Ok(None);
    }

    let mem_end = ph
        .p_vaddr
        .checked_add(ph.p_memsz)
        .ok_or(KernelError::InvalidExecutable {
            reason: "segment wraps the address space",
        })?;
    if ph.p_vaddr as usize >= KERNEL_VIRT_BASE || mem_end as usize > KERNEL_VIRT_BASE {
        return Err(KernelError::InvalidExecutable {
            reason: "segment touches kernel space",
        });
    }
    if ph.p_filesz > ph.p_memsz {
        return Err(KernelError::InvalidExecutable {
            reason: "file size exceeds memory size",
        });
    }
    if ph.p_offset as u64 + ph.p_filesz as u64 > file_len as u64 {
        return Err(KernelError::InvalidExecutable {
            reason: "segment file slice out of bounds",
        });
    }

    let mut vma_flags = VmaFlags::USER | VmaFlags::ANONYMOUS;
    let mut page_prot = PteFlags::PRESENT | PteFlags::USER;
    if ph.p_flags & PF_R != 0 {
        vma_flags |= VmaFlags::READ;
    }
    if ph.p_flags & PF_W != 0 {
        vma_flags |= VmaFlags::WRITE;
        page_prot |= PteFlags::WRITABLE;
    }
    if ph.p_flags & PF_X != 0 {
        vma_flags |= VmaFlags::EXEC;
    } else if nx_supported {
        page_prot |= PteFlags::SOFT_NX;
    }

    Ok(Some(SegmentPlan {
        vm_start: ph.p_vaddr & !(PAGE_SIZE as u32 - 1),
        vm_end: page_align_up(mem_end as usize) as u32,
        vma_flags,
        page_prot,
        vaddr: ph.p_vaddr,
        filesz: ph.p_filesz,
        memsz: ph.p_memsz,
        offset: ph.p_offset,
    }))
}

/// How much of the file lands in the page at `page_v`, and where.
/// Returns `(in_page_offset, file_offset, copy_len)`; everything else in
/// the page is zero (the frame is zero-filled before the copy).
pub fn page_copy_slice(plan: &SegmentPlan, page_v: u32) -> (usize, usize, usize) {
    let page_end = page_v as u64 + PAGE_SIZE as u64;
    let file_start = plan.vaddr as u64;
    let file_end = file_start + plan.filesz as u64;

    let copy_start = file_start.max(page_v as u64);
    let copy_end = file_end.min(page_end);
    if copy_end <= copy_start {
        return (0, 0, 0);
    }
    let in_page = (copy_start - page_v as u64) as usize;
    let file_off = (copy_start - file_start) as usize + plan.offset as usize;
    (in_page, file_off, (copy_end - copy_start) as usize)
}

/// Populate `frame_phys` for the page at `page_v` through the temp slot.
fn populate_frame(frame_phys: PhysAddr, plan: &SegmentPlan, page_v: u32, data: &[u8]) {
    let (in_page, file_off, len) = page_copy_slice(plan, page_v);
    let mapping = TempMapping::map(frame_phys);
    // SAFETY: the temp slot maps one exclusive, writable frame; the slice
    // bounds were validated against the file in `plan_segment`.
    unsafe {
        core::ptr::write_bytes(mapping.ptr(), 0, PAGE_SIZE);
        if len > 0 {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(file_off),
                mapping.ptr().add(in_page),
                len,
            );
        }
    }
}

/// Load a validated image into `mm`: insert one VMA per `PT_LOAD` and
/// materialize every page.
///
/// On failure the frame currently in flight is released; pages already
/// mapped stay owned by `mm` and are swept by its teardown.
pub fn load(data: &[u8], mm: &mut AddressSpace) -> KernelResult<LoadInfo> {
    let header = parse_header(data)?;
    let nx = crate::arch::x86::cpu::features().nx;
    let mut highest: u32 = 0;

    for index in 0..header.e_phnum {
        let ph = program_header(data, &header, index);
        let Some(plan) = plan_segment(&ph, data.len(), nx)? else {
            continue;
        };
        log::debug!(
            target: "elf",
            "segment {}: [{:#010x}-{:#010x}) filesz={:#x} memsz={:#x}",
            index,
            plan.vm_start,
            plan.vm_end,
            plan.filesz,
            plan.memsz
        );

        mm.insert_vma(
            plan.vm_start as usize,
            plan.vm_end as usize,
            plan.vma_flags,
            plan.page_prot,
            None,
            0,
        )?;

        let mut page_v = plan.vm_start;
        while page_v < plan.vm_end {
            let frame_phys = frame::frame_alloc()?;
            populate_frame(frame_phys, &plan, page_v, data);
            if let Err(err) = paging::map_single_4k(
                mm.page_directory(),
                VirtAddr::new(page_v as usize),
                frame_phys,
                plan.page_prot,
            ) {
                frame::put_frame(frame_phys);
                return Err(err);
            }
            page_v += PAGE_SIZE as u32;
        }

        highest = highest.max(plan.vaddr + plan.memsz);
    }

    let info = LoadInfo {
        entry_point: header.e_entry,
        initial_brk: page_align_up(highest as usize) as u32,
    };
    log::info!(
        target: "elf",
        "loaded: entry={:#010x} brk={:#010x}",
        info.entry_point,
        info.initial_brk
    );
    Ok(info)
}

/// Read `path` through the filesystem collaborator and load it. The file
/// buffer is dropped before returning.
pub fn load_from_path(path: &str, mm: &mut AddressSpace) -> KernelResult<LoadInfo> {
    let data = crate::fs::read_file(path)?;
    load(&data, mm)
}
