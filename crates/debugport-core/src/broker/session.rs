//! # Debug Sessions
//!
//! A session is the object a debugger holds handles to. It owns the ordered
//! event queue for every process bound to it, the "events may be present"
//! signal, and the one-way delete-pending flag set when the last handle
//! closes.
//!
//! Queue order is insertion order. Records are keyed by a monotonically
//! increasing sequence number so `continue` and detach can unlink a record
//! without disturbing the order of the rest.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace};

use super::event::{AttachId, Delivery, EventRecord, Visibility};
use super::signal::Signal;
use crate::error::{BrokerError, BrokerResult};
use crate::types::{ClientId, ProcessId};

/// Session policy flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags(u32);

impl SessionFlags
{
    /// Terminate every still-bound process when the last session handle closes.
    pub const KILL_ON_CLOSE: Self = Self(0x1);

    const VALID: u32 = Self::KILL_ON_CLOSE.0;

    pub const fn empty() -> Self
    {
        Self(0)
    }

    /// Validate raw flag bits.
    ///
    /// ## Errors
    ///
    /// - `InvalidParameter`: a bit other than the known flags is set
    pub fn from_bits(bits: u32) -> BrokerResult<Self>
    {
        if bits & !Self::VALID != 0 {
            return Err(BrokerError::InvalidParameter(format!("unknown session flags 0x{bits:x}")));
        }
        Ok(Self(bits))
    }

    pub const fn bits(self) -> u32
    {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool
    {
        self.0 & other.0 == other.0
    }
}

/// Stable session identity, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "s{}", self.0)
    }
}

/// Everything guarded by the session lock.
#[derive(Debug, Default)]
pub(crate) struct SessionState
{
    queue: BTreeMap<u64, EventRecord>,
    next_seq: u64,
    delete_pending: bool,
    kill_on_close: bool,
}

impl SessionState
{
    pub(crate) fn is_delete_pending(&self) -> bool
    {
        self.delete_pending
    }

    pub(crate) fn len(&self) -> usize
    {
        self.queue.len()
    }

    fn push(&mut self, record: EventRecord) -> u64
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert(seq, record);
        seq
    }

    /// Find the next deliverable record and mark it read.
    ///
    /// A visible record with an earlier published record of the same process
    /// is deferred instead of returned, so a debugger never holds two unanswered
    /// events from one process.
    pub(crate) fn take_next_deliverable(&mut self) -> Option<&mut EventRecord>
    {
        let mut found = None;
        let mut deferred = Vec::new();
        for (&seq, record) in &self.queue {
            if !record.is_deliverable() {
                continue;
            }
            let pid = record.client_id.process;
            // Catch-up records of an unsettled attach may still be discarded, so
            // they never hold back a published record.
            let blocked = self.queue.range(..seq).any(|(_, earlier)| {
                earlier.client_id.process == pid && !matches!(earlier.visibility, Visibility::CatchUp(_))
            });
            if blocked {
                deferred.push(seq);
                continue;
            }
            found = Some(seq);
            break;
        }

        for seq in deferred {
            if let Some(record) = self.queue.get_mut(&seq) {
                trace!(pid = %record.client_id.process, tid = %record.client_id.thread, "deferring same-process event");
                record.visibility = Visibility::Deferred;
            }
        }

        let record = self.queue.get_mut(&found?)?;
        record.delivery = Delivery::Read;
        Some(record)
    }

    /// Unlink the read record for `client_id` and let the next deferred record
    /// of the same process through.
    ///
    /// Returns the record and whether another record was reactivated.
    pub(crate) fn take_read(&mut self, client_id: ClientId) -> Option<(EventRecord, bool)>
    {
        let seq = self
            .queue
            .iter()
            .find(|(_, record)| record.client_id == client_id && record.is_read())
            .map(|(&seq, _)| seq)?;
        let record = self.queue.remove(&seq)?;

        let mut reactivated = false;
        if let Some((_, next)) = self
            .queue
            .range_mut(seq..)
            .find(|(_, next)| next.client_id.process == client_id.process && next.visibility == Visibility::Deferred)
        {
            next.visibility = Visibility::Visible;
            reactivated = true;
        }
        Some((record, reactivated))
    }

    /// Unlink every catch-up record owned by `attach`, in queue order.
    pub(crate) fn take_catch_up(&mut self, attach: AttachId) -> Vec<(u64, EventRecord)>
    {
        let seqs: Vec<u64> = self
            .queue
            .iter()
            .filter(|(_, record)| record.visibility == Visibility::CatchUp(attach))
            .map(|(&seq, _)| seq)
            .collect();
        seqs.into_iter()
            .filter_map(|seq| self.queue.remove(&seq).map(|record| (seq, record)))
            .collect()
    }

    /// Put a record back at its original position.
    pub(crate) fn restore(&mut self, seq: u64, record: EventRecord)
    {
        self.queue.insert(seq, record);
    }

    /// Unlink every record owned by `pid`.
    pub(crate) fn take_process_events(&mut self, pid: ProcessId) -> Vec<EventRecord>
    {
        let seqs: Vec<u64> = self
            .queue
            .iter()
            .filter(|(_, record)| record.process.id() == pid)
            .map(|(&seq, _)| seq)
            .collect();
        seqs.into_iter().filter_map(|seq| self.queue.remove(&seq)).collect()
    }
}

/// A debug session.
pub struct Session
{
    id: SessionId,
    state: Mutex<SessionState>,
    unread: Arc<Signal>,
    handle_count: AtomicUsize,
}

impl Session
{
    pub(crate) fn new(flags: SessionFlags) -> Arc<Self>
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Arc::new(Self {
            id: SessionId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: Mutex::new(SessionState {
                kill_on_close: flags.contains(SessionFlags::KILL_ON_CLOSE),
                ..SessionState::default()
            }),
            unread: Arc::new(Signal::new()),
            handle_count: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> SessionId
    {
        self.id
    }

    pub fn flags(&self) -> SessionFlags
    {
        if self.state.lock().kill_on_close {
            SessionFlags::KILL_ON_CLOSE
        } else {
            SessionFlags::empty()
        }
    }

    pub(crate) fn set_flags(&self, flags: SessionFlags)
    {
        self.state.lock().kill_on_close = flags.contains(SessionFlags::KILL_ON_CLOSE);
    }

    pub fn kills_on_close(&self) -> bool
    {
        self.state.lock().kill_on_close
    }

    pub fn is_delete_pending(&self) -> bool
    {
        self.state.lock().delete_pending
    }

    /// Number of queued records, in any state.
    pub fn queued_events(&self) -> usize
    {
        self.state.lock().len()
    }

    /// Whether the "events may be present" signal is set.
    pub fn has_unread_signal(&self) -> bool
    {
        self.unread.is_set()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState>
    {
        self.state.lock()
    }

    pub(crate) fn unread(&self) -> &Arc<Signal>
    {
        &self.unread
    }

    /// Link `record` into the queue, setting the unread signal if `signal`.
    ///
    /// ## Errors
    ///
    /// - `SessionInactive`: the session is being torn down; the record is
    ///   dropped, which releases whatever it holds
    pub(crate) fn insert(&self, record: EventRecord, signal: bool) -> BrokerResult<()>
    {
        let mut state = self.state.lock();
        if state.delete_pending {
            debug!(session = %self.id, pid = %record.client_id.process, "session inactive, dropping event");
            return Err(BrokerError::SessionInactive);
        }
        let kind = record.payload.kind();
        let client_id = record.client_id;
        let seq = state.push(record);
        if signal {
            self.unread.set();
        }
        debug!(session = %self.id, pid = %client_id.process, tid = %client_id.thread, %kind, seq, "queued event");
        Ok(())
    }

    /// Mark the session delete-pending and take the whole queue.
    ///
    /// The unread signal is left set so every waiter wakes and observes the
    /// teardown.
    pub(crate) fn begin_delete(&self) -> Vec<EventRecord>
    {
        let drained = {
            let mut state = self.state.lock();
            state.delete_pending = true;
            std::mem::take(&mut state.queue).into_values().collect::<Vec<_>>()
        };
        self.unread.set();
        debug!(session = %self.id, drained = drained.len(), "session delete pending");
        drained
    }

    pub(crate) fn handle_opened(&self)
    {
        self.handle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of handles still open.
    pub(crate) fn handle_closed(&self) -> usize
    {
        self.handle_count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    pub fn handle_count(&self) -> usize
    {
        self.handle_count.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Session
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("handles", &self.handle_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Session
{
    fn drop(&mut self)
    {
        let queued = self.state.get_mut().len();
        if queued != 0 {
            error!(session = %self.id, queued, "session destroyed with queued events");
        }
        debug_assert_eq!(queued, 0, "session destroyed with queued events");
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::broker::event::EventPayload;
    use crate::platform::{ProcessSpec, ProcessTable, Thread, ThreadSpec};
    use crate::types::{Address, ContinueStatus};

    fn fixture() -> (ProcessTable, Arc<crate::platform::Process>, Arc<Thread>, Arc<Thread>)
    {
        let table = ProcessTable::new();
        let process = table.create(ProcessSpec::new("target"));
        let first = process.spawn_thread(ThreadSpec::new(Address::new(0x1000))).unwrap();
        let second = process.spawn_thread(ThreadSpec::new(Address::new(0x2000))).unwrap();
        (table, process, first, second)
    }

    fn exit_thread(status: u32) -> EventPayload
    {
        EventPayload::ExitThread {
            exit_status: crate::types::NtStatus(status),
        }
    }

    fn drain(session: &Session)
    {
        for record in session.begin_delete() {
            record.wake(Err(BrokerError::DebuggerInactive));
        }
    }

    #[test]
    fn test_flags_reject_unknown_bits()
    {
        assert_eq!(SessionFlags::from_bits(1).unwrap(), SessionFlags::KILL_ON_CLOSE);
        assert!(matches!(SessionFlags::from_bits(2), Err(BrokerError::InvalidParameter(_))));
    }

    #[test]
    fn test_second_same_process_event_is_deferred_until_continue()
    {
        let (_table, process, first, second) = fixture();
        let session = Session::new(SessionFlags::empty());
        let (a, _) = EventRecord::blocking(&process, &first, exit_thread(0));
        let (b, _) = EventRecord::blocking(&process, &second, exit_thread(0));
        session.insert(a, true).unwrap();
        session.insert(b, true).unwrap();

        let mut state = session.lock();
        let delivered = state.take_next_deliverable().unwrap().client_id;
        assert_eq!(delivered, first.client_id());
        assert!(state.take_next_deliverable().is_none());

        let (record, reactivated) = state.take_read(first.client_id()).unwrap();
        assert!(reactivated);
        assert_eq!(state.take_next_deliverable().unwrap().client_id, second.client_id());
        drop(state);

        record.wake(Ok(ContinueStatus::Continue));
        drain(&session);
    }

    #[test]
    fn test_unsettled_catch_up_does_not_defer_published_record()
    {
        let (_table, process, first, second) = fixture();
        let session = Session::new(SessionFlags::empty());
        let attach = AttachId::next();
        let pending = EventRecord::catch_up(
            &process,
            &first,
            EventPayload::CreateThread {
                start_address: first.start_address(),
            },
            attach,
        );
        session.insert(pending, false).unwrap();
        let (published, _) = EventRecord::blocking(&process, &second, exit_thread(0));
        session.insert(published, true).unwrap();

        let mut state = session.lock();
        assert_eq!(state.take_next_deliverable().unwrap().client_id, second.client_id());

        // The attach that owned the catch-up record loses and discards it.
        let discarded = state.take_catch_up(attach);
        assert_eq!(discarded.len(), 1);
        let (record, reactivated) = state.take_read(second.client_id()).unwrap();
        assert!(!reactivated);
        assert_eq!(state.len(), 0);
        drop(state);

        for (_, record) in discarded {
            record.wake(Err(BrokerError::DebuggerInactive));
        }
        record.wake(Ok(ContinueStatus::Continue));
        drain(&session);
    }

    #[test]
    fn test_take_read_requires_delivered_record()
    {
        let (_table, process, first, _) = fixture();
        let session = Session::new(SessionFlags::empty());
        let (a, _) = EventRecord::blocking(&process, &first, exit_thread(0));
        session.insert(a, true).unwrap();

        assert!(session.lock().take_read(first.client_id()).is_none());
        drain(&session);
    }

    #[test]
    fn test_insert_after_delete_is_rejected()
    {
        let (_table, process, first, _) = fixture();
        let session = Session::new(SessionFlags::empty());
        drain(&session);

        let (record, _) = EventRecord::blocking(&process, &first, exit_thread(0));
        assert!(matches!(session.insert(record, true), Err(BrokerError::SessionInactive)));
        assert_eq!(session.queued_events(), 0);
        assert!(session.has_unread_signal());
    }
}
