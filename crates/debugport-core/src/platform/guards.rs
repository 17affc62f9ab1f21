//! # RAII Guards for Thread Suspension
//!
//! Guards that suspend threads and resume them automatically when dropped.
//!
//! ## Guards
//!
//! - **ThreadSuspension**: suspends one thread; attach catch-up keeps one in
//!   each synthetic event so the thread resumes when the event is continued
//!   or discarded
//! - **ProcessFreeze**: suspends every sibling of a reporting thread for the
//!   duration of a debugger round trip

use std::sync::Arc;

use super::process::{Process, Thread};
use crate::error::BrokerResult;

/// RAII guard that suspends a thread and resumes it when dropped.
#[derive(Debug)]
pub struct ThreadSuspension
{
    thread: Arc<Thread>,
    active: bool,
}

impl ThreadSuspension
{
    /// Suspend `thread`.
    ///
    /// ## Errors
    ///
    /// - `ThreadTerminating`: the thread has begun exiting
    pub fn new(thread: &Arc<Thread>) -> BrokerResult<Self>
    {
        thread.suspend()?;
        Ok(Self {
            thread: Arc::clone(thread),
            active: true,
        })
    }

    /// Resume the thread before the guard is dropped.
    pub fn resume(mut self)
    {
        if self.active {
            self.thread.resume();
            self.active = false;
        }
    }
}

impl Drop for ThreadSuspension
{
    fn drop(&mut self)
    {
        if self.active {
            self.thread.resume();
        }
    }
}

/// RAII guard that suspends every other non-system thread of a process.
///
/// Threads that are already exiting are skipped.
#[derive(Debug, Default)]
pub struct ProcessFreeze
{
    suspended: Vec<ThreadSuspension>,
}

impl ProcessFreeze
{
    /// Freeze every thread of `process` except `current`.
    pub fn siblings_of(process: &Process, current: &Thread) -> Self
    {
        let suspended = process
            .threads()
            .iter()
            .filter(|thread| thread.id() != current.id() && !thread.is_system())
            .filter_map(|thread| ThreadSuspension::new(thread).ok())
            .collect();
        Self { suspended }
    }

    /// Number of threads this guard suspended.
    pub fn len(&self) -> usize
    {
        self.suspended.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.suspended.is_empty()
    }
}
