//! # Event Records
//!
//! Kernel-side debug events: the payload a producer reports, and the record
//! that carries it through a session queue together with its delivery state
//! and the resources it must give back when it is disposed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::BrokerResult;
use crate::platform::{FileObject, Process, Thread, ThreadHold, ThreadSuspension};
use crate::types::{Address, ClientId, ContinueStatus, NtStatus};

/// An exception as raised in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord
{
    /// Exception code; `BREAKPOINT` and `SINGLE_STEP` get their own debugger states
    pub code: NtStatus,
    pub flags: u32,
    /// Faulting instruction
    pub address: Address,
    pub parameters: Vec<u64>,
}

impl ExceptionRecord
{
    pub fn new(code: NtStatus, address: Address) -> Self
    {
        Self {
            code,
            flags: 0,
            address,
            parameters: Vec::new(),
        }
    }
}

/// Exception event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo
{
    pub record: ExceptionRecord,
    /// First-chance (before any handler ran) or last-chance
    pub first_chance: bool,
}

/// Process-create payload.
#[derive(Debug, Clone, Default)]
pub struct CreateProcessInfo
{
    /// Main image file; moved into a debugger handle on delivery
    pub file: Option<Arc<FileObject>>,
    pub base_of_image: Address,
    pub debug_info_file_offset: u32,
    pub debug_info_size: u32,
    /// Initial thread entry point, when the image headers were readable
    pub start_address: Option<Address>,
}

/// Module-load payload.
#[derive(Debug, Clone, Default)]
pub struct LoadDllInfo
{
    /// Image file; moved into a debugger handle on delivery
    pub file: Option<Arc<FileObject>>,
    pub base: Address,
    pub debug_info_file_offset: u32,
    pub debug_info_size: u32,
}

/// What happened in the target.
#[derive(Debug, Clone)]
pub enum EventPayload
{
    Exception(ExceptionInfo),
    CreateThread
    {
        start_address: Address,
    },
    CreateProcess(CreateProcessInfo),
    ExitThread
    {
        exit_status: NtStatus,
    },
    ExitProcess
    {
        exit_status: NtStatus,
    },
    LoadDll(LoadDllInfo),
    UnloadDll
    {
        base: Address,
    },
}

impl EventPayload
{
    pub fn kind(&self) -> EventKind
    {
        match self {
            Self::Exception(_) => EventKind::Exception,
            Self::CreateThread { .. } => EventKind::CreateThread,
            Self::CreateProcess(_) => EventKind::CreateProcess,
            Self::ExitThread { .. } => EventKind::ExitThread,
            Self::ExitProcess { .. } => EventKind::ExitProcess,
            Self::LoadDll(_) => EventKind::LoadDll,
            Self::UnloadDll { .. } => EventKind::UnloadDll,
        }
    }
}

/// Payload discriminant, for logs and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind
{
    Exception,
    CreateThread,
    CreateProcess,
    ExitThread,
    ExitProcess,
    LoadDll,
    UnloadDll,
}

impl fmt::Display for EventKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::Exception => "exception",
            Self::CreateThread => "create-thread",
            Self::CreateProcess => "create-process",
            Self::ExitThread => "exit-thread",
            Self::ExitProcess => "exit-process",
            Self::LoadDll => "load-dll",
            Self::UnloadDll => "unload-dll",
        };
        f.write_str(name)
    }
}

/// Identity of one attach operation; owns the catch-up records it queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AttachId(u64);

impl AttachId
{
    pub(crate) fn next() -> Self
    {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AttachId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Whether the wait engine may hand a record out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visibility
{
    Visible,
    /// Held back until the debugger continues an earlier event of the same process.
    Deferred,
    /// Queued by an attach that has not reconciled yet; only that attach may touch it.
    CatchUp(AttachId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery
{
    Pending,
    Read,
}

/// Where a blocked producer picks up the debugger's reply.
#[derive(Debug, Default)]
pub(crate) struct Completion
{
    slot: Mutex<Option<BrokerResult<ContinueStatus>>>,
    cond: Condvar,
}

impl Completion
{
    pub(crate) fn complete(&self, result: BrokerResult<ContinueStatus>)
    {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) -> BrokerResult<ContinueStatus>
    {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.cond.wait(&mut slot);
        }
    }
}

/// One queued debug event.
///
/// A record owns everything it has to give back: references to its process
/// and thread, the file objects in its payload, and optionally a liveness
/// hold and a suspension of its thread. Disposing the record releases all of
/// them exactly once.
#[derive(Debug)]
pub(crate) struct EventRecord
{
    pub process: Arc<Process>,
    pub thread: Arc<Thread>,
    pub client_id: ClientId,
    pub payload: EventPayload,
    pub visibility: Visibility,
    pub delivery: Delivery,
    /// No liveness hold could be taken on the thread; its exit must go unreported.
    pub protect_failed: bool,
    pub hold: Option<ThreadHold>,
    pub suspension: Option<ThreadSuspension>,
    completion: Option<Arc<Completion>>,
}

impl EventRecord
{
    /// A record whose producer blocks on the returned completion.
    pub(crate) fn blocking(
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        payload: EventPayload,
    ) -> (Self, Arc<Completion>)
    {
        let completion = Arc::new(Completion::default());
        let mut record = Self::new(process, thread, payload, Visibility::Visible);
        record.completion = Some(Arc::clone(&completion));
        (record, completion)
    }

    /// A fire-and-forget catch-up record owned by `attach` until it reconciles.
    pub(crate) fn catch_up(process: &Arc<Process>, thread: &Arc<Thread>, payload: EventPayload, attach: AttachId)
        -> Self
    {
        Self::new(process, thread, payload, Visibility::CatchUp(attach))
    }

    fn new(process: &Arc<Process>, thread: &Arc<Thread>, payload: EventPayload, visibility: Visibility) -> Self
    {
        Self {
            process: Arc::clone(process),
            thread: Arc::clone(thread),
            client_id: thread.client_id(),
            payload,
            visibility,
            delivery: Delivery::Pending,
            protect_failed: false,
            hold: None,
            suspension: None,
            completion: None,
        }
    }

    /// Not yet read and not held back.
    pub(crate) fn is_deliverable(&self) -> bool
    {
        self.delivery == Delivery::Pending && self.visibility == Visibility::Visible
    }

    pub(crate) fn is_read(&self) -> bool
    {
        self.delivery == Delivery::Read
    }

    /// Dispose the record: resume its thread, drop the liveness hold, then
    /// either hand `result` to the blocked producer or free the record.
    pub(crate) fn wake(mut self, result: BrokerResult<ContinueStatus>)
    {
        if let Some(suspension) = self.suspension.take() {
            suspension.resume();
        }
        self.hold.take();
        if let Some(completion) = self.completion.take() {
            completion.complete(result);
        }
    }
}
