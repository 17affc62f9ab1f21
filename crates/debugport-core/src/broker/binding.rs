//! Process-to-session bindings.
//!
//! One coarse lock serializes every install and removal, and it is the lock
//! attach holds across its final "no new threads" check. It is always taken
//! before a session lock, never after.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::session::Session;
use crate::types::ProcessId;

/// Process ids are never reused, so a binding keyed by id can't outlive its
/// process into an unrelated one.
pub(crate) type Bindings = HashMap<ProcessId, Arc<Session>>;

#[derive(Debug, Default)]
pub(crate) struct BindingTable
{
    bindings: Mutex<Bindings>,
}

impl BindingTable
{
    /// Take the global binding lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Bindings>
    {
        self.bindings.lock()
    }

    pub(crate) fn get(&self, pid: ProcessId) -> Option<Arc<Session>>
    {
        self.bindings.lock().get(&pid).cloned()
    }

    pub(crate) fn is_bound(&self, pid: ProcessId) -> bool
    {
        self.bindings.lock().contains_key(&pid)
    }
}
