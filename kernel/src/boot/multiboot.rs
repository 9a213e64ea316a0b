//! Multiboot2 boot-information parsing
//!
//! The loader hands over a magic value and the physical address of a
//! length-prefixed stream of 8-byte-aligned tags. The core needs exactly
//! one tag: the memory map. From it, the largest AVAILABLE region above
//! 1 MiB that does not overlap the kernel image is selected to seed the
//! physical allocator.
//!
//! Parsing happens before paging is enabled, so the info block is read
//! through its physical address directly.

use crate::config::{BUDDY_MAX_ORDER, LOW_MEMORY_LIMIT, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Value the Multiboot2 loader leaves in the magic register
pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36D7_6289;

const TAG_TYPE_END: u32 = 0;
const TAG_TYPE_MMAP: u32 = 6;

/// Memory-map entry type: usable RAM
pub const MEMORY_AVAILABLE: u32 = 1;

/// Generic tag header: type and total tag size in bytes
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct TagHeader {
    typ: u32,
    size: u32,
}

/// Memory-map tag header; entries follow immediately
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct MmapTagHeader {
    typ: u32,
    size: u32,
    entry_size: u32,
    entry_version: u32,
}

/// One memory-map entry as laid out by the loader
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MmapEntry {
    pub addr: u64,
    pub len: u64,
    pub typ: u32,
    reserved: u32,
}

/// The region chosen to back the physical allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Page-aligned physical base
    pub base: usize,
    /// Bytes, at most `2^BUDDY_MAX_ORDER`
    pub size: usize,
}

/// Trim an AVAILABLE entry against `[0, kernel_image_end)` and the 1 MiB
/// floor. Returns the usable `(base, len)` suffix, or `None` when nothing
/// usable remains.
fn usable_suffix(addr: u64, len: u64, typ: u32, kernel_image_end: u64) -> Option<(u64, u64)> {
    if typ != MEMORY_AVAILABLE || addr < LOW_MEMORY_LIMIT as u64 {
        return None;
    }
    let end = addr.checked_add(len)?;
    let start = addr.max(kernel_image_end);
    (start < end).then(|| (start, end - start))
}

/// Page-align the base up, clamp the span to the largest buddy block, and
/// enforce the 1 MiB minimum.
fn finalize_region(base: u64, len: u64) -> KernelResult<MemoryRegion> {
    let aligned = (base + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
    let loss = aligned - base;
    if len <= loss {
        return Err(KernelError::NoUsableMemory);
    }
    let mut span = len - loss;
    span = span.min(1u64 << BUDDY_MAX_ORDER);

    // The selected window must stay addressable on a 32-bit bus
    if aligned > u32::MAX as u64 {
        return Err(KernelError::NoUsableMemory);
    }
    span = span.min(u32::MAX as u64 - aligned + 1);

    if span < (1 << 20) {
        return Err(KernelError::NoUsableMemory);
    }
    Ok(MemoryRegion {
        base: aligned as usize,
        size: span as usize,
    })
}

/// Pick the largest usable suffix among the map entries.
fn select_from_entries<I>(entries: I, kernel_image_end: usize) -> KernelResult<MemoryRegion>
where
    I: Iterator<Item = (u64, u64, u32)>,
{
    let mut best: Option<(u64, u64)> = None;
    for (addr, len, typ) in entries {
        if let Some((base, usable)) = usable_suffix(addr, len, typ, kernel_image_end as u64) {
            if best.map_or(true, |(_, b)| usable > b) {
                best = Some((base, usable));
            }
        }
    }
    let (base, len) = best.ok_or(KernelError::NoUsableMemory)?;
    finalize_region(base, len)
}

/// Walk the tag stream at `info_addr` and select the allocator region.
///
/// Fails with `BadMagic` when `magic` is not the Multiboot2 value,
/// `NoMemoryMap` when the MMAP tag is absent, and `NoUsableMemory` when
/// no AVAILABLE region survives trimming.
///
/// # Safety
///
/// `info_addr` must point at a well-formed Multiboot2 information block
/// that stays readable for the duration of the call.
pub unsafe fn select_boot_region(
    magic: u32,
    info_addr: usize,
    kernel_image_end: usize,
) -> KernelResult<MemoryRegion> {
    if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
        return Err(KernelError::BadMagic { magic });
    }

    // First tag sits 8 bytes past the total_size/reserved words
    let mut cursor = info_addr + 8;
    loop {
        // SAFETY: caller guarantees a well-formed tag stream; headers are
        // read unaligned to stay independent of the block's placement.
        let tag = unsafe { core::ptr::read_unaligned(cursor as *const TagHeader) };
        match tag.typ {
            TAG_TYPE_END => return Err(KernelError::NoMemoryMap),
            TAG_TYPE_MMAP => {
                // SAFETY: as above; the mmap header prefixes its entries.
                let header =
                    unsafe { core::ptr::read_unaligned(cursor as *const MmapTagHeader) };
                let first = cursor + core::mem::size_of::<MmapTagHeader>();
                let end = cursor + header.size as usize;
                let stride = header.entry_size as usize;
                let count = (end - first) / stride;

                let entries = (0..count).map(|i| {
                    // SAFETY: entry `i` lies inside the tag per its size
                    // field.
                    let entry = unsafe {
                        core::ptr::read_unaligned((first + i * stride) as *const MmapEntry)
                    };
                    log::debug!(
                        target: "multiboot",
                        "mmap entry: addr={:#x} len={:#x} type={}",
                        entry.addr,
                        entry.len,
                        entry.typ
                    );
                    (entry.addr, entry.len, entry.typ)
                });
                let region = select_from_entries(entries, kernel_image_end)?;
                log::info!(
                    target: "multiboot",
                    "selected region {:#010x}..{:#010x}",
                    region.base,
                    region.base + region.size
                );
                return Ok(region);
            }
            _ => {
                // Next tag: size rounded up to 8-byte alignment
                cursor += ((tag.size as usize) + 7) & !7;
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::vec::Vec;

    use super::*;

    /// Build a Multiboot2 info block (8-byte aligned) with one mmap tag.
    fn build_info(entries: &[(u64, u64, u32)]) -> Vec<u64> {
        let mut words: Vec<u32> = Vec::new();
        let mmap_size = 16 + entries.len() * 24;
        let total = 8 + mmap_size + 8;
        words.push(total as u32); // total_size
        words.push(0); // reserved
        words.push(TAG_TYPE_MMAP);
        words.push(mmap_size as u32);
        words.push(24); // entry_size
        words.push(0); // entry_version
        for &(addr, len, typ) in entries {
            words.push(addr as u32);
            words.push((addr >> 32) as u32);
            words.push(len as u32);
            words.push((len >> 32) as u32);
            words.push(typ);
            words.push(0);
        }
        words.push(TAG_TYPE_END);
        words.push(8);

        // Repack into u64 storage for 8-byte alignment
        let mut out = Vec::new();
        for pair in words.chunks(2) {
            let lo = pair[0] as u64;
            let hi = *pair.get(1).unwrap_or(&0) as u64;
            out.push(lo | (hi << 32));
        }
        out
    }

    #[test]
    fn bad_magic_is_rejected() {
        let blob = build_info(&[(0x40_0000, 0x80_0000, MEMORY_AVAILABLE)]);
        let err = unsafe { select_boot_region(0x2BAD_B002, blob.as_ptr() as usize, 0x20_0000) };
        assert_eq!(err, Err(KernelError::BadMagic { magic: 0x2BAD_B002 }));
    }

    #[test]
    fn picks_the_largest_region_above_one_mib() {
        // Two AVAILABLE entries; kernel image ends at 2 MiB. The first
        // entry is both small and below the kernel end.
        let blob = build_info(&[
            (0x10_0000, 0x1_0000, MEMORY_AVAILABLE),
            (0x40_0000, 0x80_0000, MEMORY_AVAILABLE),
        ]);
        let region = unsafe {
            select_boot_region(
                MULTIBOOT2_BOOTLOADER_MAGIC,
                blob.as_ptr() as usize,
                0x20_0000,
            )
        }
        .expect("selection");
        assert_eq!(
            region,
            MemoryRegion {
                base: 0x40_0000,
                size: 0x80_0000
            }
        );
    }

    #[test]
    fn region_straddling_the_kernel_is_trimmed() {
        let blob = build_info(&[(0x10_0000, 0x40_0000, MEMORY_AVAILABLE)]);
        let region = unsafe {
            select_boot_region(
                MULTIBOOT2_BOOTLOADER_MAGIC,
                blob.as_ptr() as usize,
                0x20_0000,
            )
        }
        .expect("trimmed selection");
        assert_eq!(
            region,
            MemoryRegion {
                base: 0x20_0000,
                size: 0x30_0000
            }
        );
    }

    #[test]
    fn reserved_and_low_regions_do_not_count() {
        let blob = build_info(&[
            (0x0, 0x9_F000, MEMORY_AVAILABLE),    // below 1 MiB
            (0x40_0000, 0x80_0000, 2),            // reserved
        ]);
        let err = unsafe {
            select_boot_region(
                MULTIBOOT2_BOOTLOADER_MAGIC,
                blob.as_ptr() as usize,
                0x20_0000,
            )
        };
        assert_eq!(err, Err(KernelError::NoUsableMemory));
    }

    #[test]
    fn sub_mib_result_is_no_usable_memory() {
        let blob = build_info(&[(0x40_0000, 0x8_0000, MEMORY_AVAILABLE)]);
        let err = unsafe {
            select_boot_region(
                MULTIBOOT2_BOOTLOADER_MAGIC,
                blob.as_ptr() as usize,
                0x20_0000,
            )
        };
        assert_eq!(err, Err(KernelError::NoUsableMemory));
    }

    #[test]
    fn missing_mmap_tag_is_reported() {
        // Only an END tag after the header
        let blob: [u64; 2] = [16, (8u64 << 32) | TAG_TYPE_END as u64];
        let err = unsafe {
            select_boot_region(
                MULTIBOOT2_BOOTLOADER_MAGIC,
                blob.as_ptr() as usize,
                0x20_0000,
            )
        };
        assert_eq!(err, Err(KernelError::NoMemoryMap));
    }

    #[test]
    fn oversized_region_is_clamped_to_the_buddy_maximum() {
        let blob = build_info(&[(0x40_0000, 1 << 30, MEMORY_AVAILABLE)]);
        let region = unsafe {
            select_boot_region(
                MULTIBOOT2_BOOTLOADER_MAGIC,
                blob.as_ptr() as usize,
                0x20_0000,
            )
        }
        .expect("clamped selection");
        assert_eq!(region.size, 1 << BUDDY_MAX_ORDER);
    }
}
