//! Basalt kernel core
//!
//! The memory and process-creation core of a 32-bit (i686, non-PAE)
//! protected-mode kernel: physical frame allocation, paging with a
//! recursive self-map, per-process address spaces with on-demand fault
//! handling, ELF32 loading, and ring-3 process construction.
//!
//! The crate is a `no_std` library. The platform layer (Multiboot2 entry
//! stub, GDT/IDT install, ISR stubs, context switch, drivers, filesystem,
//! scheduler) links against it and calls in through `boot::kernel_main`,
//! `mm::page_fault::page_fault_handler`, and the `fs`/`process`
//! collaborator registrations.
//!
//! It also compiles for the host so the unit tests run under the standard
//! harness; hardware access is arch-gated, and host builds delegate to
//! the system allocator.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// On bare metal the kernel heap (mm::heap) backs the global allocator.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub(crate) static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod arch;
pub mod boot;
pub mod config;
pub mod elf;
pub mod error;
pub mod fs;
pub mod klog;
pub mod mm;
mod panic;
pub mod process;

pub use error::{KernelError, KernelResult};
