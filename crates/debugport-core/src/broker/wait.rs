//! Debugger side: `wait_for_event` and `continue_event`.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::signal::{Alert, WaitStatus};
use super::state::PendingStateChange;
use super::{Broker, WaitOutcome};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{ClientId, ContinueStatus, Handle};

impl Broker
{
    /// Wait for the next deliverable event of a session.
    ///
    /// `timeout` of `None` waits forever; `Some(Duration::ZERO)` polls. With
    /// an `alert`, the wait is alertable and returns `Alerted` when it is
    /// raised. Timeouts and alerts leave the queue untouched.
    ///
    /// Handles for the process, thread and image file of a create or load
    /// event are opened in the broker's handle table and belong to the
    /// caller.
    ///
    /// ## Errors
    ///
    /// - `DebuggerInactive`: the session is being torn down
    /// - `InvalidHandle` / `ObjectTypeMismatch`: bad session handle
    pub fn wait_for_event(
        &self,
        session: Handle,
        timeout: Option<Duration>,
        alert: Option<&Alert>,
    ) -> BrokerResult<WaitOutcome>
    {
        let session = self.handles.session(session)?;
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        loop {
            match session.unread().wait(deadline, alert) {
                WaitStatus::Signaled => {}
                WaitStatus::TimedOut => return Ok(WaitOutcome::TimedOut),
                WaitStatus::Alerted => return Ok(WaitOutcome::Alerted),
            }

            let pending = {
                let mut state = session.lock();
                if state.is_delete_pending() {
                    return Err(BrokerError::DebuggerInactive);
                }
                match state.take_next_deliverable() {
                    Some(record) => PendingStateChange::capture(record),
                    None => {
                        trace!(session = %session.id(), "nothing deliverable, clearing signal");
                        session.unread().clear();
                        continue;
                    }
                }
            };

            let event = pending.open(&self.handles);
            debug!(session = %session.id(), event = %event.describe(), "event delivered");
            return Ok(WaitOutcome::Event(event));
        }
    }

    /// Answer the delivered event of `client_id` and release its producer.
    ///
    /// `status` must be one of the `DBG_*` reply codes.
    ///
    /// ## Errors
    ///
    /// - `InvalidParameter`: unknown reply code, or no delivered event for
    ///   `client_id` (never delivered, or already continued)
    pub fn continue_event(&self, session: Handle, client_id: ClientId, status: u32) -> BrokerResult<()>
    {
        let status = ContinueStatus::try_from(status)?;
        let session = self.handles.session(session)?;

        let (record, reactivated) = {
            let mut state = session.lock();
            let taken = state.take_read(client_id);
            if matches!(taken, Some((_, true))) {
                session.unread().set();
            }
            taken
        }
        .ok_or_else(|| BrokerError::InvalidParameter(format!("no delivered event for {client_id}")))?;

        debug!(session = %session.id(), pid = %client_id.process, tid = %client_id.thread, %status, reactivated, "event continued");
        record.wake(Ok(status));
        Ok(())
    }
}
