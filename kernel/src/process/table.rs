//! Global process table

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use super::{Process, ProcessId};

static TABLE: Mutex<BTreeMap<u32, Arc<Process>>> = Mutex::new(BTreeMap::new());

/// Insert a fully constructed process.
pub fn add(proc: Arc<Process>) {
    let previous = TABLE.lock().insert(proc.pid.0, proc);
    debug_assert!(previous.is_none(), "duplicate pid in process table");
}

/// Look up a process by ID.
pub fn get(pid: ProcessId) -> Option<Arc<Process>> {
    TABLE.lock().get(&pid.0).cloned()
}

/// Remove a process; the caller usually holds the last references.
pub fn remove(pid: ProcessId) -> Option<Arc<Process>> {
    TABLE.lock().remove(&pid.0)
}

/// Number of live (tabled) processes.
pub fn count() -> usize {
    TABLE.lock().len()
}
