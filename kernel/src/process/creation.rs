//! Process construction and teardown
//!
//! [`create_user_process`] assembles everything a first dispatch needs:
//! a page directory cloned from the kernel's, a mapped kernel stack
//! published to the TSS, the loaded ELF image, heap and stack VMAs, a
//! pre-faulted user-stack page, and the synthetic IRET frame. Every step
//! can fail; failures release earlier state in reverse order.
//!
//! On dispatch the scheduler loads `kernel_esp_for_switch` into ESP,
//! loads the process directory into CR3, and executes IRET; later
//! ring-3 → ring-0 transitions land on the TSS `esp0` published here.

extern crate alloc;

use alloc::sync::Arc;

use super::memory;
use super::{alloc_pid, pcb::Process, table, ProcessId, ProcessState};
use crate::arch::x86::{gdt, tss};
use crate::config::{PAGE_SIZE, USER_STACK_BOTTOM_VIRT, USER_STACK_TOP_VIRT};
use crate::elf;
use crate::error::KernelResult;
use crate::mm::address_space::{AddressSpace, VmaFlags};
use crate::mm::paging::{self, PteFlags};
use crate::mm::{frame, VirtAddr};

/// Initial EFLAGS for ring 3: reserved bit 1 set, IF = 1
const USER_EFLAGS_DEFAULT: u32 = 0x202;

/// Push the five-dword IRET frame onto a kernel stack, top down:
/// user SS, user ESP, EFLAGS, user CS, user EIP. Returns the resulting
/// kernel ESP. General-purpose registers are not seeded; their content at
/// user entry is unspecified.
fn build_iret_frame(kernel_stack_top: usize, entry_point: u32, user_stack_top: u32) -> usize {
    let mut sp = kernel_stack_top as *mut u32;
    // SAFETY: the caller owns at least 20 writable bytes below
    // `kernel_stack_top` (a freshly mapped kernel stack, or a test
    // buffer).
    unsafe {
        sp = sp.sub(1);
        *sp = gdt::USER_DATA_SELECTOR | gdt::RPL_USER;
        sp = sp.sub(1);
        *sp = user_stack_top;
        sp = sp.sub(1);
        *sp = USER_EFLAGS_DEFAULT;
        sp = sp.sub(1);
        *sp = gdt::USER_CODE_SELECTOR | gdt::RPL_USER;
        sp = sp.sub(1);
        *sp = entry_point;
    }
    sp as usize
}

/// Create a user process from the executable at `path`.
///
/// The returned PCB is in the table, marked `Ready`, and already handed
/// to the scheduler collaborator (when one is registered).
pub fn create_user_process(path: &str) -> KernelResult<Arc<Process>> {
    let pid = alloc_pid();
    log::info!(target: "process", "creating pid {} from '{}'", pid, path);

    // Page directory: kernel half copied, user half empty, recursive slot
    // pointing home.
    let pd_phys = paging::clone_directory(paging::kernel_directory())?;

    // Kernel stack, mapped into the kernel directory.
    let kstack = match memory::allocate_kernel_stack() {
        Ok(ks) => ks,
        Err(err) => {
            frame::put_frame(pd_phys);
            return Err(err);
        }
    };

    // Ring-3 -> ring-0 transitions for this process land on this stack.
    tss::set_kernel_stack(kstack.vaddr_top);

    let mut mm = AddressSpace::new(pd_phys);

    match setup_user_image(path, &mut mm) {
        Ok(load) => {
            let kernel_esp =
                build_iret_frame(kstack.vaddr_top, load.entry_point, USER_STACK_TOP_VIRT as u32);
            let proc = Arc::new(Process::new(
                pid,
                mm,
                kstack,
                load.entry_point,
                USER_STACK_TOP_VIRT as u32,
                kernel_esp,
            ));
            proc.set_state(ProcessState::Ready);
            table::add(proc.clone());
            super::notify_ready(proc.clone());
            log::info!(
                target: "process",
                "pid {} ready: entry={:#010x} kesp={:#010x}",
                pid,
                load.entry_point,
                kernel_esp
            );
            Ok(proc)
        }
        Err(err) => {
            log::warn!(target: "process", "pid {} creation failed: {}", pid, err);
            // Reverse order: user space and VMAs, kernel stack, then the
            // directory frame itself.
            mm.destroy();
            memory::free_kernel_stack(kstack);
            frame::put_frame(pd_phys);
            Err(err)
        }
    }
}

/// Steps 6–8: ELF load, heap and stack VMAs, pre-faulted user-stack page.
/// On error the caller sweeps everything through `mm.destroy()`.
fn setup_user_image(path: &str, mm: &mut AddressSpace) -> KernelResult<elf::LoadInfo> {
    let load = elf::load_from_path(path, mm)?;
    mm.start_brk = load.initial_brk as usize;
    mm.end_brk = load.initial_brk as usize;

    // Zero-size heap placeholder at the break; grown later by brk.
    // Failure is tolerable, the first brk call will fail instead.
    let heap_flags = VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER | VmaFlags::ANONYMOUS;
    if mm
        .insert_vma(
            load.initial_brk as usize,
            load.initial_brk as usize,
            heap_flags,
            PteFlags::user_data(),
            None,
            0,
        )
        .is_err()
    {
        log::warn!(
            target: "process",
            "no heap VMA at {:#010x} (overlaps a segment)",
            load.initial_brk
        );
    }

    // The grows-down user stack.
    mm.insert_vma(
        USER_STACK_BOTTOM_VIRT,
        USER_STACK_TOP_VIRT,
        heap_flags | VmaFlags::GROWS_DOWN,
        PteFlags::user_data(),
        None,
        0,
    )?;

    // Pre-fault the top stack page so the first push at user entry works
    // before demand-growth can.
    let top_page = VirtAddr::new(USER_STACK_TOP_VIRT - PAGE_SIZE);
    let stack_frame = frame::frame_alloc()?;
    paging::zero_frame(stack_frame);
    if let Err(err) =
        paging::map_single_4k(mm.page_directory(), top_page, stack_frame, PteFlags::user_data())
    {
        frame::put_frame(stack_frame);
        return Err(err);
    }

    Ok(load)
}

/// Destroy a process and free all of its resources, in the load-bearing
/// order: memory descriptor (user pages and tables), kernel stack frames,
/// kernel-stack mapping, the page-directory frame, then the PCB itself.
///
/// The process must not be current and must hold no CPU.
pub fn destroy_process(proc: Arc<Process>) {
    assert!(
        super::current().map_or(true, |cur| cur.pid != proc.pid),
        "destroy_process called on the current process"
    );
    let pid = proc.pid;
    table::remove(pid);

    if let Some(mm) = proc.address_space.lock().take() {
        mm.destroy();
    }
    if let Some(kstack) = proc.kernel_stack.lock().take() {
        memory::free_kernel_stack(kstack);
    }
    frame::put_frame(proc.page_directory_phys);

    log::info!(target: "process", "pid {} destroyed", pid);
    // The PCB itself is freed when the last Arc reference drops.
    drop(proc);
}

/// Look up and destroy by PID. No-op when the PID is unknown.
pub fn destroy_process_by_pid(pid: ProcessId) {
    if let Some(proc) = table::get(pid) {
        destroy_process(proc);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn iret_frame_layout_is_exact() {
        // 8 dwords of "kernel stack"; the frame occupies the top five.
        let mut stack = [0u32; 8];
        let top = unsafe { stack.as_mut_ptr().add(8) } as usize;

        let entry = 0x0804_80A0u32;
        let user_sp = USER_STACK_TOP_VIRT as u32;
        let kesp = build_iret_frame(top, entry, user_sp);

        assert_eq!(kesp, top - 20);
        // Ascending addresses: EIP, CS, EFLAGS, ESP, SS
        assert_eq!(stack[3..8], [
            entry,
            gdt::USER_CODE_SELECTOR | 3,
            0x202,
            user_sp,
            gdt::USER_DATA_SELECTOR | 3,
        ]);
    }

    #[test]
    fn pid_allocation_is_monotonic() {
        let a = alloc_pid();
        let b = alloc_pid();
        assert!(b.0 > a.0);
    }
}
