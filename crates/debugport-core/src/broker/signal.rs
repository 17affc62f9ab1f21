//! Notification signal with timeout and alert support.
//!
//! [`Signal`] is a manual-reset notification: once set it wakes every waiter
//! and stays set until cleared. [`Alert`] lets another thread interrupt an
//! alertable wait without setting the signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// How a wait on a [`Signal`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus
{
    Signaled,
    TimedOut,
    Alerted,
}

/// Manual-reset notification signal.
#[derive(Debug, Default)]
pub struct Signal
{
    state: Mutex<bool>,
    cond: Condvar,
}

impl Signal
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn set(&self)
    {
        let mut state = self.state.lock();
        *state = true;
        self.cond.notify_all();
    }

    pub fn clear(&self)
    {
        *self.state.lock() = false;
    }

    pub fn is_set(&self) -> bool
    {
        *self.state.lock()
    }

    /// Block until the signal is set, `deadline` passes, or `alert` is raised.
    ///
    /// A pending alert is consumed by the wait that observes it.
    pub fn wait(self: &Arc<Self>, deadline: Option<Instant>, alert: Option<&Alert>) -> WaitStatus
    {
        if let Some(alert) = alert {
            alert.register(self);
        }
        let status = self.wait_registered(deadline, alert);
        if let Some(alert) = alert {
            alert.unregister();
        }
        status
    }

    fn wait_registered(&self, deadline: Option<Instant>, alert: Option<&Alert>) -> WaitStatus
    {
        let mut state = self.state.lock();
        loop {
            if *state {
                return WaitStatus::Signaled;
            }
            if alert.is_some_and(Alert::take) {
                return WaitStatus::Alerted;
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return WaitStatus::TimedOut;
                    }
                    // Loop re-checks both the signal and the deadline.
                    let _ = self.cond.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn wake(&self)
    {
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

#[derive(Debug, Default)]
struct AlertInner
{
    pending: AtomicBool,
    waiting_on: Mutex<Option<Arc<Signal>>>,
}

/// Capability to interrupt an alertable wait.
///
/// Clone it, hand one copy to the waiter and keep the other to call
/// [`raise`](Alert::raise). Raising with no waiter leaves the alert pending
/// for the next alertable wait.
#[derive(Debug, Clone, Default)]
pub struct Alert
{
    inner: Arc<AlertInner>,
}

impl Alert
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Raise the alert, waking the wait that is using it (if any).
    pub fn raise(&self)
    {
        self.inner.pending.store(true, Ordering::SeqCst);
        let waiting_on = self.inner.waiting_on.lock().clone();
        if let Some(signal) = waiting_on {
            signal.wake();
        }
    }

    pub fn is_pending(&self) -> bool
    {
        self.inner.pending.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool
    {
        self.inner.pending.swap(false, Ordering::SeqCst)
    }

    fn register(&self, signal: &Arc<Signal>)
    {
        *self.inner.waiting_on.lock() = Some(Arc::clone(signal));
    }

    fn unregister(&self)
    {
        self.inner.waiting_on.lock().take();
    }
}
