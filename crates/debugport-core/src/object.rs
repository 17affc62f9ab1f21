//! # Object Table
//!
//! Handle-based access to sessions, processes, threads and file objects.
//!
//! A handle owns one reference to its object. Session handles are also
//! counted on the session itself, because closing the last one starts
//! session teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::broker::Session;
use crate::error::{BrokerError, BrokerResult};
use crate::platform::{FileObject, Process, Thread};
use crate::types::Handle;

const HANDLE_INCREMENT: u64 = 4;

/// An object reachable through a handle.
#[derive(Debug, Clone)]
pub enum KernelObject
{
    Session(Arc<Session>),
    Process(Arc<Process>),
    Thread(Arc<Thread>),
    File(Arc<FileObject>),
}

impl KernelObject
{
    /// Object type name, as used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str
    {
        match self {
            Self::Session(_) => "debug session",
            Self::Process(_) => "process",
            Self::Thread(_) => "thread",
            Self::File(_) => "file",
        }
    }
}

/// The handle table.
#[derive(Debug)]
pub struct HandleTable
{
    next: AtomicU64,
    entries: Mutex<HashMap<Handle, KernelObject>>,
}

impl Default for HandleTable
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl HandleTable
{
    pub fn new() -> Self
    {
        Self {
            next: AtomicU64::new(HANDLE_INCREMENT),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `object` and return a new handle to it.
    pub fn insert(&self, object: KernelObject) -> Handle
    {
        if let KernelObject::Session(session) = &object {
            session.handle_opened();
        }
        let handle = Handle(self.next.fetch_add(HANDLE_INCREMENT, Ordering::Relaxed));
        self.entries.lock().insert(handle, object);
        handle
    }

    /// Look up the object behind `handle`.
    ///
    /// ## Errors
    ///
    /// - `InvalidHandle`: no such handle
    pub fn get(&self, handle: Handle) -> BrokerResult<KernelObject>
    {
        self.entries
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(BrokerError::InvalidHandle(handle))
    }

    pub fn session(&self, handle: Handle) -> BrokerResult<Arc<Session>>
    {
        match self.get(handle)? {
            KernelObject::Session(session) => Ok(session),
            _ => Err(mismatch(handle, "debug session")),
        }
    }

    pub fn process(&self, handle: Handle) -> BrokerResult<Arc<Process>>
    {
        match self.get(handle)? {
            KernelObject::Process(process) => Ok(process),
            _ => Err(mismatch(handle, "process")),
        }
    }

    pub fn thread(&self, handle: Handle) -> BrokerResult<Arc<Thread>>
    {
        match self.get(handle)? {
            KernelObject::Thread(thread) => Ok(thread),
            _ => Err(mismatch(handle, "thread")),
        }
    }

    pub fn file(&self, handle: Handle) -> BrokerResult<Arc<FileObject>>
    {
        match self.get(handle)? {
            KernelObject::File(file) => Ok(file),
            _ => Err(mismatch(handle, "file")),
        }
    }

    /// Remove `handle`, returning the object it referenced.
    ///
    /// Session handle counts are *not* adjusted here; the broker does that so
    /// it can run teardown on the last close.
    pub(crate) fn remove(&self, handle: Handle) -> BrokerResult<KernelObject>
    {
        self.entries.lock().remove(&handle).ok_or(BrokerError::InvalidHandle(handle))
    }

    /// Remove every handle, in handle order.
    pub(crate) fn drain(&self) -> Vec<(Handle, KernelObject)>
    {
        let mut drained: Vec<_> = self.entries.lock().drain().collect();
        drained.sort_by_key(|(handle, _)| *handle);
        drained
    }

    pub fn len(&self) -> usize
    {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.lock().is_empty()
    }
}

fn mismatch(handle: Handle, expected: &'static str) -> BrokerError
{
    BrokerError::ObjectTypeMismatch { handle, expected }
}
