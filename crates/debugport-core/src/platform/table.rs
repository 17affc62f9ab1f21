//! # Process Table
//!
//! Every live process, keyed by id, with the "next process after X" cursor
//! that session teardown uses to find bound processes.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::process::{Process, ProcessSpec, ThreadSpec};
use crate::types::{Address, ProcessId};

/// Id of the system process.
pub const SYSTEM_PROCESS_ID: ProcessId = ProcessId(4);

const FIRST_USER_PROCESS_ID: u32 = 8;
const FIRST_THREAD_ID: u64 = 12;

/// The system-wide process list.
#[derive(Debug)]
pub struct ProcessTable
{
    processes: RwLock<BTreeMap<ProcessId, Arc<Process>>>,
    next_process: AtomicU32,
    thread_ids: Arc<AtomicU64>,
    system: Arc<Process>,
}

impl Default for ProcessTable
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl ProcessTable
{
    /// A table holding only the system process (one system thread, no address space).
    pub fn new() -> Self
    {
        let thread_ids = Arc::new(AtomicU64::new(FIRST_THREAD_ID));
        let system = Arc::new(Process::new(
            SYSTEM_PROCESS_ID,
            ProcessSpec::new("System").without_address_space(),
            true,
            Arc::clone(&thread_ids),
        ));
        // A fresh process is never terminating, so this can't fail.
        let _ = system.spawn_thread(ThreadSpec::new(Address::ZERO).system());

        let mut processes = BTreeMap::new();
        processes.insert(SYSTEM_PROCESS_ID, Arc::clone(&system));
        Self {
            processes: RwLock::new(processes),
            next_process: AtomicU32::new(FIRST_USER_PROCESS_ID),
            thread_ids,
            system,
        }
    }

    /// Create a user process with no threads.
    pub fn create(&self, spec: ProcessSpec) -> Arc<Process>
    {
        let mut processes = self.processes.write();
        let id = ProcessId(self.next_process.fetch_add(4, Ordering::Relaxed));
        let process = Arc::new(Process::new(id, spec, false, Arc::clone(&self.thread_ids)));
        processes.insert(id, Arc::clone(&process));
        process
    }

    pub fn get(&self, id: ProcessId) -> Option<Arc<Process>>
    {
        self.processes.read().get(&id).cloned()
    }

    pub fn system_process(&self) -> &Arc<Process>
    {
        &self.system
    }

    /// The first process after `after`, or the first process if `after` is `None`.
    ///
    /// Resumable after `after` itself has been removed from the table.
    pub fn next_process(&self, after: Option<&Process>) -> Option<Arc<Process>>
    {
        let processes = self.processes.read();
        match after {
            None => processes.values().next().cloned(),
            Some(process) => processes
                .range((Bound::Excluded(process.id()), Bound::Unbounded))
                .next()
                .map(|(_, next)| Arc::clone(next)),
        }
    }

    /// Drop a fully exited process from the table.
    pub fn remove(&self, id: ProcessId) -> Option<Arc<Process>>
    {
        self.processes.write().remove(&id)
    }

    pub fn len(&self) -> usize
    {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.processes.read().is_empty()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_table_starts_with_system_process()
    {
        let table = ProcessTable::new();
        let system = table.system_process();
        assert!(system.is_system());
        assert_eq!(system.id(), SYSTEM_PROCESS_ID);
        assert!(system.threads()[0].is_system());
        assert!(!system.has_address_space());
    }

    #[test]
    fn test_next_process_walks_in_id_order_across_removal()
    {
        let table = ProcessTable::new();
        let a = table.create(ProcessSpec::new("a"));
        let b = table.create(ProcessSpec::new("b"));
        let c = table.create(ProcessSpec::new("c"));

        let mut seen = Vec::new();
        let mut cursor = table.next_process(None);
        while let Some(process) = cursor {
            seen.push(process.id());
            if process.id() == a.id() {
                table.remove(b.id());
            }
            cursor = table.next_process(Some(&process));
        }
        assert_eq!(seen, vec![SYSTEM_PROCESS_ID, a.id(), c.id()]);
    }
}
