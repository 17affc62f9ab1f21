//! # Event Producers
//!
//! Target-side hooks. Each runs on the thread the event is about, checks
//! whether the process is bound and whether the thread is flagged to skip
//! the report, then queues a blocking record and waits for the debugger's
//! reply.
//!
//! Every `report_*` returns the debugger's `ContinueStatus`. `PortNotSet`
//! means nobody is listening (not bound, hidden thread, suppressed report);
//! `DebuggerInactive` means the debugger went away while the thread waited.

use std::sync::Arc;

use tracing::{debug, trace};

use super::event::{CreateProcessInfo, EventKind, EventPayload, EventRecord, ExceptionInfo, ExceptionRecord, LoadDllInfo};
use super::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::platform::{MappedImage, Process, ProcessFreeze, Thread};
use crate::types::{Address, ContinueStatus, NtStatus};

/// What a producer hands to the queue.
enum Report
{
    Event
    {
        payload: EventPayload,
        freeze: bool,
    },
    /// A process-create if none was reported yet, a thread-create otherwise.
    ThreadStart
    {
        create_process: Option<CreateProcessInfo>,
    },
}

impl Report
{
    fn event(payload: EventPayload, freeze: bool) -> Self
    {
        Self::Event { payload, freeze }
    }
}

impl Broker
{
    /// A thread starts running.
    ///
    /// The first thread of a process runs the image-notify callbacks and
    /// reports the process-create; later threads report a thread-create.
    pub fn report_thread_start(&self, process: &Arc<Process>, thread: &Arc<Thread>) -> BrokerResult<ContinueStatus>
    {
        if !process.mark_image_notified() {
            if let Some(image) = process.image() {
                for callback in &self.image_notify {
                    callback(process.id(), image);
                }
            }
        }

        // Resolve the image up front; the create kind is settled under the global lock.
        let create_process = (!process.create_reported()).then(|| self.create_process_info(process, thread));
        self.queue_blocking(process, thread, Report::ThreadStart { create_process })
    }

    fn create_process_info(&self, process: &Process, thread: &Thread) -> CreateProcessInfo
    {
        let mut info = CreateProcessInfo {
            start_address: Some(thread.start_address()),
            ..CreateProcessInfo::default()
        };
        if let Some(image) = process.image() {
            info.base_of_image = image.base;
            // Skip file and header work when nobody would see it.
            if self.bindings.is_bound(process.id()) {
                info.file = self.resolver.open_file(image);
                if let Some(headers) = self.resolver.read_headers(image) {
                    info.debug_info_file_offset = headers.symbol_table_offset;
                    info.debug_info_size = headers.symbol_count;
                }
            }
        }
        info
    }

    /// A thread other than the last one is exiting.
    pub fn report_thread_exit(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        exit_status: NtStatus,
    ) -> BrokerResult<ContinueStatus>
    {
        let payload = EventPayload::ExitThread { exit_status };
        self.queue_blocking(process, thread, Report::event(payload, self.config.freeze_on_report))
    }

    /// The last thread of a process is exiting.
    pub fn report_process_exit(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        exit_status: NtStatus,
    ) -> BrokerResult<ContinueStatus>
    {
        self.queue_blocking(process, thread, Report::event(EventPayload::ExitProcess { exit_status }, false))
    }

    /// An image was mapped into the process.
    pub fn report_module_load(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        image: &MappedImage,
    ) -> BrokerResult<ContinueStatus>
    {
        if !self.bindings.is_bound(process.id()) {
            return Err(BrokerError::PortNotSet);
        }
        let mut info = LoadDllInfo {
            file: self.resolver.open_file(image),
            base: image.base,
            ..LoadDllInfo::default()
        };
        if let Some(headers) = self.resolver.read_headers(image) {
            info.debug_info_file_offset = headers.symbol_table_offset;
            info.debug_info_size = headers.symbol_count;
        }
        let payload = EventPayload::LoadDll(info);
        self.queue_blocking(process, thread, Report::event(payload, self.config.freeze_on_report))
    }

    /// An image was unmapped from the process.
    pub fn report_module_unload(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        base: Address,
    ) -> BrokerResult<ContinueStatus>
    {
        let payload = EventPayload::UnloadDll { base };
        self.queue_blocking(process, thread, Report::event(payload, self.config.freeze_on_report))
    }

    /// An exception was raised on `thread`.
    ///
    /// The reply tells the exception dispatcher what to do:
    /// `ExceptionHandled`/`Continue` resume, `ExceptionNotHandled` passes the
    /// exception on.
    pub fn report_exception(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        record: ExceptionRecord,
        first_chance: bool,
    ) -> BrokerResult<ContinueStatus>
    {
        let payload = EventPayload::Exception(ExceptionInfo { record, first_chance });
        self.queue_blocking(process, thread, Report::event(payload, false))
    }

    /// Queue a blocking record and wait for the debugger.
    ///
    /// The binding is read, the payload settled and the record linked under
    /// the global lock, so an attach that is settling its catch-up records
    /// can't interleave with the suppression checks below or with the
    /// process-create decision of a starting thread.
    fn queue_blocking(&self, process: &Arc<Process>, thread: &Arc<Thread>, report: Report) -> BrokerResult<ContinueStatus>
    {
        if thread.is_hidden_from_debugger() {
            trace!(pid = %process.id(), tid = %thread.id(), "thread hidden from debugger");
            return Err(BrokerError::PortNotSet);
        }
        if !self.bindings.is_bound(process.id()) {
            return Err(BrokerError::PortNotSet);
        }

        let (kind, completion, _freeze) = {
            let bindings = self.bindings.lock();
            let Some(session) = bindings.get(&process.id()) else {
                trace!(pid = %process.id(), tid = %thread.id(), "binding dropped before report");
                return Err(BrokerError::PortNotSet);
            };

            let (payload, freeze) = match report {
                Report::Event { payload, freeze } => (payload, freeze),
                Report::ThreadStart { create_process } => {
                    if process.mark_create_reported() {
                        let payload = EventPayload::CreateThread {
                            start_address: thread.start_address(),
                        };
                        (payload, self.config.freeze_on_report)
                    } else {
                        let info = create_process.unwrap_or_else(|| CreateProcessInfo {
                            start_address: Some(thread.start_address()),
                            ..CreateProcessInfo::default()
                        });
                        (EventPayload::CreateProcess(info), false)
                    }
                }
            };

            let kind = payload.kind();
            let suppressed = match kind {
                EventKind::CreateThread | EventKind::CreateProcess => thread.skips_creation_report(),
                EventKind::ExitThread | EventKind::ExitProcess => thread.skips_termination_report(),
                _ => false,
            };
            if suppressed {
                trace!(pid = %process.id(), tid = %thread.id(), %kind, "event not reported");
                return Err(BrokerError::PortNotSet);
            }

            let freeze = freeze.then(|| ProcessFreeze::siblings_of(process, thread));
            let (record, completion) = EventRecord::blocking(process, thread, payload);
            session.insert(record, true)?;
            (kind, completion, freeze)
        };

        debug!(pid = %process.id(), tid = %thread.id(), %kind, "producer waiting for debugger");
        let reply = completion.wait();
        debug!(pid = %process.id(), tid = %thread.id(), %kind, ?reply, "producer released");
        reply
    }

    /// Exit `thread`, reporting a thread exit (or a process exit when it is
    /// the last thread) first.
    pub fn exit_thread(&self, process: &Arc<Process>, thread: &Arc<Thread>, exit_status: NtStatus)
    {
        if process.thread_count() > 1 {
            let _ = self.report_thread_exit(process, thread, exit_status);
            process.exit_thread(thread, exit_status);
        } else {
            self.exit_process(process, thread, exit_status);
        }
    }

    /// Exit the whole process from its last running `thread`.
    ///
    /// Reports the process exit, terminates the process, drops its binding
    /// and removes it from the process table.
    pub fn exit_process(&self, process: &Arc<Process>, thread: &Arc<Thread>, exit_status: NtStatus)
    {
        let _ = self.report_process_exit(process, thread, exit_status);
        process.terminate(exit_status);
        if self.clear_process_session(process, None).is_ok() {
            debug!(pid = %process.id(), "binding dropped at exit");
        }
        self.processes.remove(process.id());
    }

    /// Map an image into the process and report it.
    pub fn map_image(&self, process: &Arc<Process>, thread: &Arc<Thread>, image: MappedImage) -> Option<ContinueStatus>
    {
        process.map_image(image.clone());
        self.report_module_load(process, thread, &image).ok()
    }

    /// Unmap the image at `base` and report it.
    pub fn unmap_image(&self, process: &Arc<Process>, thread: &Arc<Thread>, base: Address) -> Option<ContinueStatus>
    {
        process.unmap_image(base)?;
        self.report_module_unload(process, thread, base).ok()
    }
}
