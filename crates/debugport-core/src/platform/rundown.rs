//! # Rundown Protection
//!
//! A rundown reference lets a caller inspect a process or thread without it
//! completing exit underneath them. Acquisition fails once the owner has begun
//! exiting; the exit path then waits for outstanding holders to drain.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct RundownState
{
    holders: usize,
    closed: bool,
}

/// Rundown protection for one kernel object.
#[derive(Debug, Default)]
pub struct RundownProtection
{
    state: Mutex<RundownState>,
    drained: Condvar,
}

impl RundownProtection
{
    /// Create an open rundown block with no holders.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Take a hold. Returns `false` if rundown has already begun.
    pub fn try_acquire(&self) -> bool
    {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.holders += 1;
        true
    }

    /// Drop a hold taken with [`try_acquire`](Self::try_acquire).
    pub fn release(&self)
    {
        let mut state = self.state.lock();
        debug_assert!(state.holders > 0, "rundown released more often than acquired");
        state.holders = state.holders.saturating_sub(1);
        if state.holders == 0 {
            self.drained.notify_all();
        }
    }

    /// Refuse further acquisitions without waiting for current holders.
    pub fn close(&self)
    {
        self.state.lock().closed = true;
    }

    /// Whether rundown has begun.
    pub fn is_closed(&self) -> bool
    {
        self.state.lock().closed
    }

    /// Number of outstanding holds.
    pub fn holders(&self) -> usize
    {
        self.state.lock().holders
    }

    /// Close and block until every outstanding hold has been released.
    pub fn wait_for_rundown(&self)
    {
        let mut state = self.state.lock();
        state.closed = true;
        while state.holders > 0 {
            self.drained.wait(&mut state);
        }
    }
}
