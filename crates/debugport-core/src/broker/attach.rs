//! # Attach and Detach
//!
//! Attaching to a running process has to produce exactly one create event
//! per thread, whether the thread existed before the attach, was created
//! while it ran, or appears afterwards. The sequence is:
//!
//! 1. Walk the threads and queue a hidden catch-up record for each (a
//!    process-create for the first reportable thread, thread-creates for the
//!    rest, then module loads for the images already mapped).
//! 2. Under the global lock, install the binding, and if a thread appeared
//!    after the last one walked, back the binding out, catch that tail up and
//!    retry. Once no new thread shows up the binding stays.
//! 3. Under the session lock, publish or discard this attach's catch-up
//!    records.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::event::{AttachId, CreateProcessInfo, EventPayload, EventRecord, LoadDllInfo, Visibility};
use super::session::Session;
use super::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::platform::{AddressSpaceView, Process, ProcessHold, Thread, ThreadHold, ThreadSuspension};
use crate::types::Handle;

/// First and last thread a catch-up pass queued records for.
struct CatchUpPass
{
    first: Arc<Thread>,
    last: Arc<Thread>,
}

impl Broker
{
    /// Attach `session` to `process`.
    ///
    /// ## Errors
    ///
    /// - `AccessDenied`: the target is the system process
    /// - `ProcessTerminating`: the target is exiting
    /// - `PortAlreadySet`: the process is already bound (possibly by a
    ///   concurrent attach that won the race)
    /// - `DebuggerInactive`: the session was torn down during the attach
    /// - `Unsuccessful`: the process has no thread that can be reported
    pub fn attach(&self, process: Handle, session: Handle) -> BrokerResult<()>
    {
        let process = self.handles.process(process)?;
        let session = self.handles.session(session)?;
        self.attach_process(&process, &session)
    }

    pub(crate) fn attach_process(&self, process: &Arc<Process>, session: &Arc<Session>) -> BrokerResult<()>
    {
        if process.is_system() {
            return Err(BrokerError::AccessDenied(format!("cannot debug system process {}", process.id())));
        }
        let _hold = ProcessHold::acquire(process).ok_or(BrokerError::ProcessTerminating(process.id()))?;

        let attach = AttachId::next();
        debug!(pid = %process.id(), session = %session.id(), %attach, "attach started");

        let pass = self.post_fake_process_create_messages(process, session, attach);
        let result = self.set_process_session(process, session, attach, pass);
        match &result {
            Ok(()) => info!(pid = %process.id(), session = %session.id(), %attach, "attached"),
            Err(err) => info!(pid = %process.id(), session = %session.id(), %attach, %err, "attach failed"),
        }
        result
    }

    fn post_fake_process_create_messages(
        &self,
        process: &Arc<Process>,
        session: &Arc<Session>,
        attach: AttachId,
    ) -> BrokerResult<CatchUpPass>
    {
        let pass = self.post_fake_thread_messages(process, session, attach, None)?;
        self.post_fake_module_messages(process, &pass.first, session, attach);
        Ok(pass)
    }

    /// Queue catch-up create records for every thread from `start` on (or
    /// from the first thread).
    ///
    /// Only a pass starting from the beginning reports a process-create.
    fn post_fake_thread_messages(
        &self,
        process: &Arc<Process>,
        session: &Arc<Session>,
        attach: AttachId,
        start: Option<Arc<Thread>>,
    ) -> BrokerResult<CatchUpPass>
    {
        let mut needs_first = start.is_none();
        let mut first = start.clone();
        let mut last = None;

        let mut cursor = start.or_else(|| process.next_thread(None));
        while let Some(thread) = cursor {
            last = Some(Arc::clone(&thread));

            let hold = ThreadHold::acquire(&thread);
            let protect_failed = hold.is_none();
            let suspension = match &hold {
                Some(_) if !thread.is_system() => ThreadSuspension::new(&thread).ok(),
                _ => None,
            };

            let is_first = needs_first && !protect_failed && !thread.is_system() && thread.granted_access() != 0;
            let payload = if is_first {
                EventPayload::CreateProcess(self.catch_up_create_process(process))
            } else {
                EventPayload::CreateThread {
                    start_address: thread.start_address(),
                }
            };

            let mut record = EventRecord::catch_up(process, &thread, payload, attach);
            record.protect_failed = protect_failed;
            record.hold = hold;
            record.suspension = suspension;
            session.insert(record, false)?;

            if is_first {
                needs_first = false;
                first = Some(Arc::clone(&thread));
            }
            cursor = process.next_thread(Some(&thread));
        }

        match (first, last) {
            (Some(first), Some(last)) => Ok(CatchUpPass { first, last }),
            _ => Err(BrokerError::Unsuccessful(format!(
                "process {} has no thread to report",
                process.id()
            ))),
        }
    }

    fn catch_up_create_process(&self, process: &Process) -> CreateProcessInfo
    {
        let Some(image) = process.image() else {
            return CreateProcessInfo::default();
        };
        let mut info = CreateProcessInfo {
            file: self.resolver.open_file(image),
            base_of_image: image.base,
            ..CreateProcessInfo::default()
        };
        if info.file.is_none() {
            warn!(pid = %process.id(), base = %image.base, "no file for main image");
        }
        match self.resolver.read_headers(image) {
            Some(headers) => {
                info.debug_info_file_offset = headers.symbol_table_offset;
                info.debug_info_size = headers.symbol_count;
                info.start_address = image.base.checked_add(headers.entry_point_rva);
            }
            None => warn!(pid = %process.id(), base = %image.base, "main image headers unreadable"),
        }
        info
    }

    /// Queue catch-up module loads for the loader list, skipping the main
    /// image (the process-create carries it). Failures are ignored.
    fn post_fake_module_messages(&self, process: &Arc<Process>, first: &Arc<Thread>, session: &Arc<Session>, attach: AttachId)
    {
        let Some(view) = AddressSpaceView::adopt(process) else {
            return;
        };
        let modules = view.loaded_modules();
        let limit = self.config.module_scan_limit;
        if modules.len() > limit {
            warn!(pid = %process.id(), modules = modules.len(), limit, "loader list truncated");
        }

        for image in modules.iter().take(limit).skip(1) {
            let mut info = LoadDllInfo {
                file: self.resolver.open_file(image),
                base: image.base,
                ..LoadDllInfo::default()
            };
            if let Some(headers) = self.resolver.read_headers(image) {
                info.debug_info_file_offset = headers.symbol_table_offset;
                info.debug_info_size = headers.symbol_count;
            } else {
                warn!(pid = %process.id(), base = %image.base, "module headers unreadable");
            }
            let record = EventRecord::catch_up(process, first, EventPayload::LoadDll(info), attach);
            if let Err(err) = session.insert(record, false) {
                debug!(pid = %process.id(), base = %image.base, %err, "module catch-up dropped");
            }
        }
    }

    /// Install the binding and settle this attach's catch-up records.
    fn set_process_session(
        &self,
        process: &Arc<Process>,
        session: &Arc<Session>,
        attach: AttachId,
        pass: BrokerResult<CatchUpPass>,
    ) -> BrokerResult<()>
    {
        let pid = process.id();
        let (mut result, last) = match pass {
            Ok(pass) => (Ok(()), Some(pass.last)),
            Err(err) => (Err(err), None),
        };
        let mut global = None;

        if let Some(mut last) = last {
            loop {
                let mut bindings = self.bindings.lock();
                if bindings.contains_key(&pid) {
                    result = Err(BrokerError::PortAlreadySet);
                    global = Some(bindings);
                    break;
                }
                bindings.insert(pid, Arc::clone(session));

                let Some(next) = process.next_thread(Some(&last)) else {
                    global = Some(bindings);
                    break;
                };

                // A thread appeared since the last pass: back out, catch it up, retry.
                bindings.remove(&pid);
                drop(bindings);
                debug!(%pid, tid = %next.id(), %attach, "thread created during attach");
                match self.post_fake_thread_messages(process, session, attach, Some(next)) {
                    Ok(tail) => last = tail.last,
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
        }

        let discarded = {
            let mut state = session.lock();
            if result.is_ok() {
                if state.is_delete_pending() {
                    if let Some(bindings) = global.as_mut() {
                        bindings.remove(&pid);
                    }
                    result = Err(BrokerError::DebuggerInactive);
                } else {
                    process.set_no_debug_inherit();
                    process.mark_create_reported();
                }
            }

            let mut first = true;
            let mut discarded = Vec::new();
            for (seq, mut record) in state.take_catch_up(attach) {
                record.hold.take();
                let reportable =
                    result.is_ok() && record.thread.granted_access() != 0 && !record.thread.is_system();
                if !reportable {
                    discarded.push(record);
                } else if record.protect_failed {
                    // The debugger never sees this thread start, so it must not see it exit.
                    record.thread.suppress_termination_report();
                    discarded.push(record);
                } else {
                    if first {
                        record.visibility = Visibility::Visible;
                        session.unread().set();
                        first = false;
                    } else {
                        record.visibility = Visibility::Deferred;
                    }
                    record.thread.suppress_creation_report();
                    state.restore(seq, record);
                }
            }
            discarded
        };
        drop(global);

        if !discarded.is_empty() {
            debug!(%pid, %attach, discarded = discarded.len(), "discarding catch-up records");
        }
        for record in discarded {
            record.wake(Err(BrokerError::DebuggerInactive));
        }

        if result.is_ok() {
            self.mark_being_debugged(process);
        }
        result
    }

    /// Detach `session` from `process`.
    ///
    /// Queued events of the process are removed and their producers released
    /// with `DebuggerInactive`.
    ///
    /// ## Errors
    ///
    /// - `PortNotSet`: the process is not bound to this session
    pub fn detach(&self, process: Handle, session: Handle) -> BrokerResult<()>
    {
        let process = self.handles.process(process)?;
        let session = self.handles.session(session)?;
        self.clear_process_session(&process, Some(&session))
    }

    /// Remove `process`'s binding (to `expected`, or to any session).
    pub(crate) fn clear_process_session(&self, process: &Process, expected: Option<&Arc<Session>>) -> BrokerResult<()>
    {
        let pid = process.id();
        let session = {
            let mut bindings = self.bindings.lock();
            match (bindings.get(&pid), expected) {
                (Some(bound), Some(expected)) if !Arc::ptr_eq(bound, expected) => None,
                (Some(_), _) => bindings.remove(&pid),
                (None, _) => None,
            }
        }
        .ok_or(BrokerError::PortNotSet)?;

        self.mark_being_debugged(process);

        let records = session.lock().take_process_events(pid);
        info!(%pid, session = %session.id(), released = records.len(), "detached");
        for record in records {
            record.wake(Err(BrokerError::DebuggerInactive));
        }
        Ok(())
    }
}
