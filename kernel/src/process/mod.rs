//! Process management
//!
//! Process construction and teardown for the memory core: PCBs, the
//! global process table, kernel-stack allocation, and the first
//! ring-3 transition. Scheduling itself is a collaborator: the platform
//! registers a [`Scheduler`], receives ready PCBs, and publishes which
//! process is current.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, Once};

pub mod creation;
pub mod memory;
pub mod pcb;
pub mod table;

pub use creation::{create_user_process, destroy_process};
pub use pcb::{Process, ProcessState};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic PID allocator; single-CPU, but an atomic keeps the increment
/// race-free for free.
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next process ID.
pub fn alloc_pid() -> ProcessId {
    ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

/// Scheduler collaborator interface.
pub trait Scheduler: Sync {
    /// A fully constructed process is ready to run.
    fn process_ready(&self, proc: Arc<Process>);

    /// Remove `pid` from execution and never return to the caller (the
    /// faulting context is dead).
    fn terminate(&self, pid: ProcessId) -> !;
}

static SCHEDULER: Once<&'static dyn Scheduler> = Once::new();

/// Register the scheduler. First registration wins.
pub fn register_scheduler(sched: &'static dyn Scheduler) {
    SCHEDULER.call_once(|| sched);
}

/// The process currently executing on the CPU, published by the scheduler
/// around every dispatch.
static CURRENT: Mutex<Option<Arc<Process>>> = Mutex::new(None);

/// Publish the current process (scheduler dispatch path).
pub fn set_current(proc: Option<Arc<Process>>) {
    *CURRENT.lock() = proc;
}

/// PCB of the process currently on the CPU.
pub fn current() -> Option<Arc<Process>> {
    CURRENT.lock().clone()
}

/// Kill the current process after an unrecoverable fault. Marks it a
/// zombie and hands control to the scheduler, which must not return here.
pub fn terminate_current() -> ! {
    let proc = CURRENT.lock().take();
    let Some(proc) = proc else {
        panic!("terminate_current with no current process");
    };
    proc.set_state(ProcessState::Zombie);
    log::info!(target: "process", "pid {} terminated", proc.pid);

    match SCHEDULER.get() {
        Some(sched) => sched.terminate(proc.pid),
        None => panic!("process {} faulted fatally with no scheduler", proc.pid),
    }
}

/// Hand a ready process to the scheduler, if one is registered.
pub(crate) fn notify_ready(proc: Arc<Process>) {
    if let Some(sched) = SCHEDULER.get() {
        sched.process_ready(proc);
    }
}
