//! Process control block

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::memory::KernelStack;
use super::ProcessId;
use crate::mm::address_space::AddressSpace;
use crate::mm::PhysAddr;

/// Lifecycle state of a process
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Under construction, not yet visible to the scheduler
    Creating = 0,
    /// Ready to be dispatched
    Ready = 1,
    /// Currently on the CPU
    Running = 2,
    /// Terminated, awaiting teardown
    Zombie = 3,
}

/// Per-process bookkeeping. Built completely by
/// [`creation::create_user_process`](super::creation::create_user_process)
/// before it becomes visible anywhere.
pub struct Process {
    pub pid: ProcessId,
    state: AtomicU32,

    /// Memory descriptor; `None` once teardown has begun
    pub address_space: Mutex<Option<AddressSpace>>,
    /// The page-directory frame. Owned by the PCB and freed last.
    pub page_directory_phys: PhysAddr,
    /// Kernel stack bookkeeping; `None` once released
    pub kernel_stack: Mutex<Option<KernelStack>>,

    /// ELF entry point, the first user EIP
    pub entry_point: u32,
    /// Initial user ESP (top of the user-stack VMA)
    pub user_stack_top: u32,
    /// Kernel ESP to load immediately before the first IRET
    pub kernel_esp_for_switch: usize,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        pid: ProcessId,
        address_space: AddressSpace,
        kernel_stack: KernelStack,
        entry_point: u32,
        user_stack_top: u32,
        kernel_esp_for_switch: usize,
    ) -> Self {
        let page_directory_phys = address_space.page_directory();
        Self {
            pid,
            state: AtomicU32::new(ProcessState::Creating as u32),
            address_space: Mutex::new(Some(address_space)),
            page_directory_phys,
            kernel_stack: Mutex::new(Some(kernel_stack)),
            entry_point,
            user_stack_top,
            kernel_esp_for_switch,
        }
    }

    pub fn state(&self) -> ProcessState {
        match self.state.load(Ordering::Acquire) {
            0 => ProcessState::Creating,
            1 => ProcessState::Ready,
            2 => ProcessState::Running,
            _ => ProcessState::Zombie,
        }
    }

    pub fn set_state(&self, state: ProcessState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Virtual top of the kernel stack (for the TSS `esp0` on dispatch).
    pub fn kernel_stack_top(&self) -> Option<usize> {
        self.kernel_stack.lock().as_ref().map(|ks| ks.vaddr_top)
    }
}
