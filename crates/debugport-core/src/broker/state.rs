//! # Debugger-Visible State Changes
//!
//! The shape `wait_for_event` returns. Translation happens in two steps: under
//! the session lock the record's payload is copied out (moving any file
//! object out of the record), and after the lock is dropped the process,
//! thread and file references become handles in the debugger's table.

use std::fmt;
use std::sync::Arc;

use super::event::{EventPayload, EventRecord, ExceptionInfo};
use crate::object::{HandleTable, KernelObject};
use crate::platform::{Process, Thread};
use crate::types::{Address, ClientId, Handle, NtStatus};

/// A debug event as the debugger sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitStateChange
{
    /// The thread that produced the event; pass it back to `continue_event`
    pub client_id: ClientId,
    pub info: StateInfo,
}

impl WaitStateChange
{
    /// One-line description, for logs and the CLI.
    pub fn describe(&self) -> String
    {
        format!("[{}] {}", self.client_id, self.info)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateInfo
{
    Breakpoint(ExceptionInfo),
    SingleStep(ExceptionInfo),
    Exception(ExceptionInfo),
    CreateThread
    {
        thread: Handle,
        start_address: Address,
    },
    CreateProcess
    {
        process: Handle,
        thread: Handle,
        file: Option<Handle>,
        base_of_image: Address,
        debug_info_file_offset: u32,
        debug_info_size: u32,
        start_address: Option<Address>,
    },
    ExitThread
    {
        exit_status: NtStatus,
    },
    ExitProcess
    {
        exit_status: NtStatus,
    },
    LoadDll
    {
        file: Option<Handle>,
        base: Address,
        debug_info_file_offset: u32,
        debug_info_size: u32,
    },
    UnloadDll
    {
        base: Address,
    },
}

impl StateInfo
{
    /// Handles this state change opened in the debugger's table.
    pub fn handles(&self) -> Vec<Handle>
    {
        match self {
            Self::CreateThread { thread, .. } => vec![*thread],
            Self::CreateProcess {
                process, thread, file, ..
            } => [Some(*process), Some(*thread), *file].into_iter().flatten().collect(),
            Self::LoadDll { file, .. } => file.iter().copied().collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for StateInfo
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Breakpoint(info) => write!(f, "breakpoint at {}", info.record.address),
            Self::SingleStep(info) => write!(f, "single step at {}", info.record.address),
            Self::Exception(info) => write!(
                f,
                "exception {} at {} ({} chance)",
                info.record.code,
                info.record.address,
                if info.first_chance { "first" } else { "second" }
            ),
            Self::CreateThread { thread, start_address } => {
                write!(f, "create thread {thread} start {start_address}")
            }
            Self::CreateProcess {
                process,
                thread,
                file,
                base_of_image,
                ..
            } => {
                write!(f, "create process {process} thread {thread} image {base_of_image}")?;
                if let Some(file) = file {
                    write!(f, " file {file}")?;
                }
                Ok(())
            }
            Self::ExitThread { exit_status } => write!(f, "exit thread {exit_status}"),
            Self::ExitProcess { exit_status } => write!(f, "exit process {exit_status}"),
            Self::LoadDll { file, base, .. } => {
                write!(f, "load dll {base}")?;
                if let Some(file) = file {
                    write!(f, " file {file}")?;
                }
                Ok(())
            }
            Self::UnloadDll { base } => write!(f, "unload dll {base}"),
        }
    }
}

/// A state change copied out of a record under the session lock, still
/// holding object references instead of handles.
#[derive(Debug)]
pub(crate) struct PendingStateChange
{
    client_id: ClientId,
    process: Arc<Process>,
    thread: Arc<Thread>,
    payload: EventPayload,
}

impl PendingStateChange
{
    /// Copy `record` out; file objects move out of the record, which no longer
    /// owns them.
    pub(crate) fn capture(record: &mut EventRecord) -> Self
    {
        let payload = record.payload.clone();
        match &mut record.payload {
            EventPayload::CreateProcess(info) => info.file = None,
            EventPayload::LoadDll(info) => info.file = None,
            _ => {}
        }
        Self {
            client_id: record.client_id,
            process: Arc::clone(&record.process),
            thread: Arc::clone(&record.thread),
            payload,
        }
    }

    /// Open the debugger's handles and produce the final state change.
    pub(crate) fn open(self, handles: &HandleTable) -> WaitStateChange
    {
        let info = match self.payload {
            EventPayload::Exception(info) => match info.record.code {
                NtStatus::BREAKPOINT => StateInfo::Breakpoint(info),
                NtStatus::SINGLE_STEP => StateInfo::SingleStep(info),
                _ => StateInfo::Exception(info),
            },
            EventPayload::CreateThread { start_address } => StateInfo::CreateThread {
                thread: handles.insert(KernelObject::Thread(self.thread)),
                start_address,
            },
            EventPayload::CreateProcess(info) => StateInfo::CreateProcess {
                thread: handles.insert(KernelObject::Thread(self.thread)),
                process: handles.insert(KernelObject::Process(self.process)),
                file: info.file.map(|file| handles.insert(KernelObject::File(file))),
                base_of_image: info.base_of_image,
                debug_info_file_offset: info.debug_info_file_offset,
                debug_info_size: info.debug_info_size,
                start_address: info.start_address,
            },
            EventPayload::ExitThread { exit_status } => StateInfo::ExitThread { exit_status },
            EventPayload::ExitProcess { exit_status } => StateInfo::ExitProcess { exit_status },
            EventPayload::LoadDll(info) => StateInfo::LoadDll {
                file: info.file.map(|file| handles.insert(KernelObject::File(file))),
                base: info.base,
                debug_info_file_offset: info.debug_info_file_offset,
                debug_info_size: info.debug_info_size,
            },
            EventPayload::UnloadDll { base } => StateInfo::UnloadDll { base },
        };
        WaitStateChange {
            client_id: self.client_id,
            info,
        }
    }
}
