//! # Debug Event Broker
//!
//! The broker connects debuggers to target processes:
//!
//! - **session**: per-debugger event queue, unread signal and teardown flag
//! - **binding**: the process → session table behind one global lock
//! - **attach**: catch-up synthesis and the binding install race
//! - **wait**: `wait_for_event` / `continue_event`
//! - **producer**: target-side lifecycle hooks that report events
//!
//! ## Lock Order
//!
//! A process's address-space lock, then the global binding lock, then a
//! session lock. No lock is held while a producer or debugger blocks.
//!
//! ## Example
//!
//! ```rust
//! use debugport_core::broker::{Broker, WaitOutcome};
//! use debugport_core::platform::{ProcessSpec, ThreadSpec};
//! use debugport_core::types::{Address, ContinueStatus};
//! use std::time::Duration;
//!
//! let broker = Broker::new();
//! let process = broker.create_process(ProcessSpec::new("target"), None);
//! process.spawn_thread(ThreadSpec::new(Address::new(0x1000))).unwrap();
//!
//! let session = broker.create_session(0).unwrap();
//! let target = broker.open_process(process.id()).unwrap();
//! broker.attach(target, session).unwrap();
//!
//! if let WaitOutcome::Event(event) = broker.wait_for_event(session, Some(Duration::ZERO), None).unwrap() {
//!     broker
//!         .continue_event(session, event.client_id, ContinueStatus::Continue.code())
//!         .unwrap();
//! }
//! ```

mod attach;
mod binding;
pub mod event;
mod producer;
pub mod session;
pub mod signal;
pub mod state;
mod wait;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

pub use event::{CreateProcessInfo, EventKind, EventPayload, ExceptionInfo, ExceptionRecord, LoadDllInfo};
pub use session::{Session, SessionFlags, SessionId};
pub use signal::{Alert, Signal, WaitStatus};
pub use state::{StateInfo, WaitStateChange};

use self::binding::BindingTable;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::object::{HandleTable, KernelObject};
use crate::platform::{
    AddressSpaceView, ImageNotifyCallback, ImageResolver, LoaderImageResolver, MappedImage, Process, ProcessSpec,
    ProcessTable, Thread,
};
use crate::types::{Handle, NtStatus, ProcessId};

/// Result of a wait that didn't fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome
{
    /// An event was delivered and must be answered with `continue_event`.
    Event(WaitStateChange),
    TimedOut,
    Alerted,
}

impl WaitOutcome
{
    pub fn into_event(self) -> Option<WaitStateChange>
    {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}

/// Information classes accepted by [`Broker::set_session_information`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInfoClass
{
    /// A little-endian `u32` of [`SessionFlags`] bits.
    Flags,
}

/// Builder for [`Broker`].
///
/// ## Example
///
/// ```rust
/// use debugport_core::broker::BrokerBuilder;
/// use debugport_core::config::BrokerConfig;
///
/// let broker = BrokerBuilder::new()
///     .config(BrokerConfig {
///         module_scan_limit: 64,
///         ..BrokerConfig::default()
///     })
///     .on_image_notify(|pid, image| println!("{pid}: image at {}", image.base))
///     .build();
/// assert_eq!(broker.config().module_scan_limit, 64);
/// ```
#[derive(Default)]
pub struct BrokerBuilder
{
    config: BrokerConfig,
    resolver: Option<Arc<dyn ImageResolver>>,
    image_notify: Vec<ImageNotifyCallback>,
}

impl BrokerBuilder
{
    pub fn new() -> Self
    {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: BrokerConfig) -> Self
    {
        self.config = config;
        self
    }

    /// Use `resolver` for image files and headers instead of [`LoaderImageResolver`].
    #[must_use]
    pub fn resolver(mut self, resolver: impl ImageResolver + 'static) -> Self
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Register a callback run once per process for its main image.
    #[must_use]
    pub fn on_image_notify<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProcessId, &MappedImage) + Send + Sync + 'static,
    {
        self.image_notify.push(Arc::new(callback));
        self
    }

    pub fn build(self) -> Broker
    {
        Broker {
            processes: ProcessTable::new(),
            bindings: BindingTable::default(),
            handles: HandleTable::new(),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(LoaderImageResolver)),
            image_notify: self.image_notify,
            config: self.config,
        }
    }
}

impl fmt::Debug for BrokerBuilder
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("BrokerBuilder")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("image_notify", &self.image_notify.len())
            .finish()
    }
}

/// The debug event broker.
///
/// Share it between debugger and target threads with an `Arc`.
pub struct Broker
{
    processes: ProcessTable,
    bindings: BindingTable,
    handles: HandleTable,
    resolver: Arc<dyn ImageResolver>,
    image_notify: Vec<ImageNotifyCallback>,
    config: BrokerConfig,
}

impl Default for Broker
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Broker
{
    /// A broker with the default configuration and image resolver.
    pub fn new() -> Self
    {
        BrokerBuilder::new().build()
    }

    pub fn builder() -> BrokerBuilder
    {
        BrokerBuilder::new()
    }

    pub fn config(&self) -> &BrokerConfig
    {
        &self.config
    }

    pub fn processes(&self) -> &ProcessTable
    {
        &self.processes
    }

    pub fn handles(&self) -> &HandleTable
    {
        &self.handles
    }

    /// Create a process, inheriting `parent`'s binding.
    ///
    /// The binding is copied unless the parent was flagged no-debug-inherit
    /// (attach sets that flag) or the parent's session is being torn down.
    pub fn create_process(&self, spec: ProcessSpec, parent: Option<&Arc<Process>>) -> Arc<Process>
    {
        let child = self.processes.create(spec);
        let inherited = parent.is_some_and(|parent| self.inherit_binding(parent, &child));
        if inherited {
            self.mark_being_debugged(&child);
        }
        debug!(pid = %child.id(), name = child.name(), inherited, "process created");
        child
    }

    /// Create a process that starts out bound to `session`, the way a
    /// debugger launches its debuggee.
    ///
    /// No catch-up is needed: the process has no threads yet, and its first
    /// thread reports the process-create itself.
    ///
    /// ## Errors
    ///
    /// - `DebuggerInactive`: the session is being torn down
    /// - `InvalidHandle` / `ObjectTypeMismatch`: bad session handle
    pub fn create_debugged_process(&self, spec: ProcessSpec, session: Handle) -> BrokerResult<Arc<Process>>
    {
        let session = self.handles.session(session)?;
        let process = {
            let mut bindings = self.bindings.lock();
            if session.is_delete_pending() {
                return Err(BrokerError::DebuggerInactive);
            }
            let process = self.processes.create(spec);
            bindings.insert(process.id(), Arc::clone(&session));
            process
        };
        self.mark_being_debugged(&process);
        info!(pid = %process.id(), name = process.name(), session = %session.id(), "process created under debugger");
        Ok(process)
    }

    fn inherit_binding(&self, parent: &Process, child: &Process) -> bool
    {
        if parent.no_debug_inherit() {
            return false;
        }
        let mut bindings = self.bindings.lock();
        let Some(session) = bindings.get(&parent.id()).cloned() else {
            return false;
        };
        let state = session.lock();
        if state.is_delete_pending() {
            return false;
        }
        drop(state);
        bindings.insert(child.id(), session);
        true
    }

    /// Open a handle to process `pid`.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: no such process
    pub fn open_process(&self, pid: ProcessId) -> BrokerResult<Handle>
    {
        let process = self.processes.get(pid).ok_or(BrokerError::ProcessNotFound(pid))?;
        Ok(self.handles.insert(KernelObject::Process(process)))
    }

    pub fn open_thread(&self, thread: &Arc<Thread>) -> Handle
    {
        self.handles.insert(KernelObject::Thread(Arc::clone(thread)))
    }

    /// Whether `pid` is currently bound to a session.
    pub fn is_debugged(&self, pid: ProcessId) -> bool
    {
        self.bindings.is_bound(pid)
    }

    /// Create a session and return a handle to it.
    ///
    /// ## Errors
    ///
    /// - `InvalidParameter`: unknown flag bits
    pub fn create_session(&self, flags: u32) -> BrokerResult<Handle>
    {
        let flags = SessionFlags::from_bits(flags)?;
        let session = Session::new(flags);
        info!(session = %session.id(), flags = flags.bits(), "session created");
        Ok(self.handles.insert(KernelObject::Session(session)))
    }

    /// Set session information.
    ///
    /// ## Errors
    ///
    /// - `InfoLengthMismatch`: `data` is not exactly four bytes
    /// - `InvalidParameter`: unknown flag bits
    /// - `InvalidHandle` / `ObjectTypeMismatch`: bad session handle
    pub fn set_session_information(&self, session: Handle, class: SessionInfoClass, data: &[u8]) -> BrokerResult<()>
    {
        let SessionInfoClass::Flags = class;
        let bytes: [u8; 4] = data.try_into().map_err(|_| BrokerError::InfoLengthMismatch {
            expected: 4,
            actual: data.len(),
        })?;
        let flags = SessionFlags::from_bits(u32::from_le_bytes(bytes))?;
        let session = self.handles.session(session)?;
        session.set_flags(flags);
        debug!(session = %session.id(), flags = flags.bits(), "session flags set");
        Ok(())
    }

    pub fn query_session_flags(&self, session: Handle) -> BrokerResult<SessionFlags>
    {
        Ok(self.handles.session(session)?.flags())
    }

    /// Open a new handle to the session `process` is bound to.
    ///
    /// ## Errors
    ///
    /// - `PortNotSet`: the process isn't being debugged
    pub fn open_process_session(&self, process: Handle) -> BrokerResult<Handle>
    {
        let process = self.handles.process(process)?;
        let session = self.bindings.get(process.id()).ok_or(BrokerError::PortNotSet)?;
        Ok(self.handles.insert(KernelObject::Session(session)))
    }

    /// Close a handle. Closing the last handle to a session tears it down.
    pub fn close_handle(&self, handle: Handle) -> BrokerResult<()>
    {
        let object = self.handles.remove(handle)?;
        self.release_object(object);
        Ok(())
    }

    fn release_object(&self, object: KernelObject)
    {
        if let KernelObject::Session(session) = object {
            if session.handle_closed() == 0 {
                self.close_session(&session);
            }
        }
    }

    /// Last-handle teardown.
    ///
    /// Every queued record is drained before any binding is removed, so a
    /// blocked producer is released even if its process vanished meanwhile.
    fn close_session(&self, session: &Arc<Session>)
    {
        let drained = session.begin_delete();
        let kill = session.kills_on_close();

        let mut unbound = 0usize;
        let mut cursor = self.processes.next_process(None);
        while let Some(process) = cursor {
            if self.unbind(&process, session) {
                unbound += 1;
                self.mark_being_debugged(&process);
                if kill {
                    info!(session = %session.id(), pid = %process.id(), "terminating debuggee on close");
                    process.terminate(NtStatus::DEBUGGER_INACTIVE);
                }
            }
            cursor = self.processes.next_process(Some(&process));
        }

        // Processes that left the table while still bound.
        {
            let mut bindings = self.bindings.lock();
            bindings.retain(|_, bound| !Arc::ptr_eq(bound, session));
        }

        let released = drained.len();
        for record in drained {
            record.wake(Err(BrokerError::DebuggerInactive));
        }
        info!(session = %session.id(), unbound, released, kill, "session closed");
    }

    /// Remove `process`'s binding if it points at `session`.
    fn unbind(&self, process: &Process, session: &Arc<Session>) -> bool
    {
        let mut bindings = self.bindings.lock();
        match bindings.get(&process.id()) {
            Some(bound) if Arc::ptr_eq(bound, session) => bindings.remove(&process.id()).is_some(),
            _ => false,
        }
    }

    /// Refresh the target-visible being-debugged flag from the binding table.
    fn mark_being_debugged(&self, process: &Process)
    {
        let Some(mut view) = AddressSpaceView::adopt(process) else {
            return;
        };
        let bound = self.bindings.is_bound(process.id());
        view.set_being_debugged(bound);
    }
}

impl fmt::Debug for Broker
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Broker")
            .field("processes", &self.processes.len())
            .field("handles", &self.handles.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for Broker
{
    fn drop(&mut self)
    {
        for (_, object) in self.handles.drain() {
            self.release_object(object);
        }
    }
}
