//! # Processes and Threads
//!
//! In-memory process and thread objects with the pieces of state the broker
//! reads and writes: thread lists with a stable "next thread" cursor, rundown
//! protection, suspend counts, per-thread report suppression flags and the
//! per-process debug flags.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::address_space::AddressSpace;
use super::image::MappedImage;
use super::rundown::RundownProtection;
use crate::error::{BrokerError, BrokerResult};
use crate::types::{Address, ClientId, NtStatus, ProcessId, ThreadId};

/// Access mask granted to a thread once it is inserted into the object table.
pub const THREAD_ALL_ACCESS: u32 = 0x001F_FFFF;

// Thread flags read by producers on other threads.
const SKIP_CREATION_REPORT: u32 = 0x1;
const SKIP_TERMINATION_REPORT: u32 = 0x2;
const HIDE_FROM_DEBUGGER: u32 = 0x4;

// Process debug flags.
const NO_DEBUG_INHERIT: u32 = 0x1;
const CREATE_REPORTED: u32 = 0x2;
const IMAGE_NOTIFY_DONE: u32 = 0x4;

/// Parameters for a new thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadSpec
{
    /// Start routine address
    pub start_address: Address,
    /// System (kernel-only) thread
    pub system: bool,
    /// Whether the thread is inserted into the object table on creation
    pub inserted: bool,
}

impl ThreadSpec
{
    /// A regular, inserted user thread.
    pub fn new(start_address: Address) -> Self
    {
        Self {
            start_address,
            system: false,
            inserted: true,
        }
    }

    /// Mark the thread as a system thread.
    #[must_use]
    pub fn system(mut self) -> Self
    {
        self.system = true;
        self
    }

    /// Leave the thread uninserted (no access granted yet).
    #[must_use]
    pub fn uninserted(mut self) -> Self
    {
        self.inserted = false;
        self
    }
}

/// A thread of a target process.
#[derive(Debug)]
pub struct Thread
{
    id: ThreadId,
    process_id: ProcessId,
    start_address: Address,
    system: bool,
    granted_access: AtomicU32,
    cross_flags: AtomicU32,
    rundown: RundownProtection,
    suspend_count: Mutex<u32>,
    exit_status: Mutex<Option<NtStatus>>,
}

impl Thread
{
    fn new(id: ThreadId, process_id: ProcessId, spec: ThreadSpec) -> Self
    {
        Self {
            id,
            process_id,
            start_address: spec.start_address,
            system: spec.system,
            granted_access: AtomicU32::new(if spec.inserted { THREAD_ALL_ACCESS } else { 0 }),
            cross_flags: AtomicU32::new(0),
            rundown: RundownProtection::new(),
            suspend_count: Mutex::new(0),
            exit_status: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ThreadId
    {
        self.id
    }

    pub fn process_id(&self) -> ProcessId
    {
        self.process_id
    }

    pub fn client_id(&self) -> ClientId
    {
        ClientId::new(self.process_id, self.id)
    }

    pub fn start_address(&self) -> Address
    {
        self.start_address
    }

    pub fn is_system(&self) -> bool
    {
        self.system
    }

    /// Access granted when the thread was inserted; zero until then.
    pub fn granted_access(&self) -> u32
    {
        self.granted_access.load(Ordering::Acquire)
    }

    /// Insert the thread into the object table, granting full access.
    pub fn insert(&self)
    {
        self.granted_access.store(THREAD_ALL_ACCESS, Ordering::Release);
    }

    /// The thread's own create report is suppressed (a synthetic one stood in for it).
    pub fn skips_creation_report(&self) -> bool
    {
        self.has_flag(SKIP_CREATION_REPORT)
    }

    pub(crate) fn suppress_creation_report(&self)
    {
        self.set_flag(SKIP_CREATION_REPORT);
    }

    /// The thread's exit report is suppressed (the debugger never saw it created).
    pub fn skips_termination_report(&self) -> bool
    {
        self.has_flag(SKIP_TERMINATION_REPORT)
    }

    pub(crate) fn suppress_termination_report(&self)
    {
        self.set_flag(SKIP_TERMINATION_REPORT);
    }

    pub fn is_hidden_from_debugger(&self) -> bool
    {
        self.has_flag(HIDE_FROM_DEBUGGER)
    }

    /// Stop this thread from producing any debug events.
    pub fn hide_from_debugger(&self)
    {
        self.set_flag(HIDE_FROM_DEBUGGER);
    }

    /// Increment the suspend count. Returns the previous count.
    ///
    /// ## Errors
    ///
    /// - `ThreadTerminating`: the thread has begun exiting
    pub fn suspend(&self) -> BrokerResult<u32>
    {
        if self.rundown.is_closed() {
            return Err(BrokerError::ThreadTerminating(self.id));
        }
        let mut count = self.suspend_count.lock();
        let previous = *count;
        *count += 1;
        Ok(previous)
    }

    /// Decrement the suspend count. Returns the previous count.
    pub fn resume(&self) -> u32
    {
        let mut count = self.suspend_count.lock();
        let previous = *count;
        if previous > 0 {
            *count -= 1;
        }
        previous
    }

    pub fn suspend_count(&self) -> u32
    {
        *self.suspend_count.lock()
    }

    /// Start exiting: record the exit status and refuse new liveness holds.
    pub fn begin_exit(&self, status: NtStatus)
    {
        self.exit_status.lock().get_or_insert(status);
        self.rundown.close();
    }

    pub fn is_terminating(&self) -> bool
    {
        self.rundown.is_closed()
    }

    pub fn exit_status(&self) -> Option<NtStatus>
    {
        *self.exit_status.lock()
    }

    fn has_flag(&self, flag: u32) -> bool
    {
        self.cross_flags.load(Ordering::Acquire) & flag != 0
    }

    fn set_flag(&self, flag: u32)
    {
        self.cross_flags.fetch_or(flag, Ordering::AcqRel);
    }
}

/// Liveness hold on a thread. Released on drop.
#[derive(Debug)]
pub struct ThreadHold
{
    thread: Arc<Thread>,
}

impl ThreadHold
{
    /// Take a hold, or `None` if the thread is already exiting.
    pub fn acquire(thread: &Arc<Thread>) -> Option<Self>
    {
        thread.rundown.try_acquire().then(|| Self {
            thread: Arc::clone(thread),
        })
    }

    pub fn thread(&self) -> &Arc<Thread>
    {
        &self.thread
    }
}

impl Drop for ThreadHold
{
    fn drop(&mut self)
    {
        self.thread.rundown.release();
    }
}

/// Liveness hold on a process. Released on drop.
#[derive(Debug)]
pub struct ProcessHold
{
    process: Arc<Process>,
}

impl ProcessHold
{
    /// Take a hold, or `None` if the process is already exiting.
    pub fn acquire(process: &Arc<Process>) -> Option<Self>
    {
        process.rundown.try_acquire().then(|| Self {
            process: Arc::clone(process),
        })
    }

    pub fn process(&self) -> &Arc<Process>
    {
        &self.process
    }
}

impl Drop for ProcessHold
{
    fn drop(&mut self)
    {
        self.process.rundown.release();
    }
}

/// Parameters for a new process.
#[derive(Debug, Clone)]
pub struct ProcessSpec
{
    /// Image name, for logs
    pub name: String,
    /// Main executable image
    pub image: Option<MappedImage>,
    /// Whether the process gets a user address space (loader list, being-debugged flag)
    pub address_space: bool,
}

impl ProcessSpec
{
    /// A process with a user address space and no image yet.
    pub fn new(name: impl Into<String>) -> Self
    {
        Self {
            name: name.into(),
            image: None,
            address_space: true,
        }
    }

    /// Set the main image. It becomes the first loader-list entry.
    #[must_use]
    pub fn with_image(mut self, image: MappedImage) -> Self
    {
        self.image = Some(image);
        self
    }

    /// Create the process without a user address space.
    #[must_use]
    pub fn without_address_space(mut self) -> Self
    {
        self.address_space = false;
        self
    }
}

/// A target process.
#[derive(Debug)]
pub struct Process
{
    id: ProcessId,
    name: String,
    system: bool,
    image: Option<MappedImage>,
    threads: RwLock<BTreeMap<ThreadId, Arc<Thread>>>,
    thread_ids: Arc<AtomicU64>,
    flags: AtomicU32,
    rundown: RundownProtection,
    exit_status: Mutex<Option<NtStatus>>,
    pub(crate) address_space: Mutex<Option<AddressSpace>>,
}

impl Process
{
    pub(crate) fn new(id: ProcessId, spec: ProcessSpec, system: bool, thread_ids: Arc<AtomicU64>) -> Self
    {
        let address_space = spec.address_space.then(|| AddressSpace::new(spec.image.iter().cloned().collect()));
        Self {
            id,
            name: spec.name,
            system,
            image: spec.image,
            threads: RwLock::new(BTreeMap::new()),
            thread_ids,
            flags: AtomicU32::new(0),
            rundown: RundownProtection::new(),
            exit_status: Mutex::new(None),
            address_space: Mutex::new(address_space),
        }
    }

    pub fn id(&self) -> ProcessId
    {
        self.id
    }

    pub fn name(&self) -> &str
    {
        &self.name
    }

    pub fn is_system(&self) -> bool
    {
        self.system
    }

    /// Main executable image (the section the process was created from).
    pub fn image(&self) -> Option<&MappedImage>
    {
        self.image.as_ref()
    }

    pub fn has_address_space(&self) -> bool
    {
        self.address_space.lock().is_some()
    }

    /// Create a thread. It sorts after every existing thread of the process.
    ///
    /// ## Errors
    ///
    /// - `ProcessTerminating`: the process has begun exiting
    pub fn spawn_thread(&self, spec: ThreadSpec) -> BrokerResult<Arc<Thread>>
    {
        if self.rundown.is_closed() {
            return Err(BrokerError::ProcessTerminating(self.id));
        }
        // Allocate under the list lock so list order always matches id order.
        let mut threads = self.threads.write();
        let id = ThreadId(self.thread_ids.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(Thread::new(id, self.id, spec));
        threads.insert(id, Arc::clone(&thread));
        Ok(thread)
    }

    /// The first thread after `after`, or the first thread if `after` is `None`.
    ///
    /// Safe to resume from a thread that has since been removed: the cursor
    /// is the thread id, not the list position.
    pub fn next_thread(&self, after: Option<&Thread>) -> Option<Arc<Thread>>
    {
        let threads = self.threads.read();
        match after {
            None => threads.values().next().cloned(),
            Some(thread) => threads
                .range((Bound::Excluded(thread.id()), Bound::Unbounded))
                .next()
                .map(|(_, next)| Arc::clone(next)),
        }
    }

    pub fn threads(&self) -> Vec<Arc<Thread>>
    {
        self.threads.read().values().cloned().collect()
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<Thread>>
    {
        self.threads.read().get(&id).cloned()
    }

    pub fn thread_count(&self) -> usize
    {
        self.threads.read().len()
    }

    /// Finish a thread's exit: wait out liveness holds and drop it from the list.
    pub fn exit_thread(&self, thread: &Thread, status: NtStatus)
    {
        thread.begin_exit(status);
        thread.rundown.wait_for_rundown();
        self.threads.write().remove(&thread.id());
    }

    /// Begin terminating the process and every thread in it.
    pub fn terminate(&self, status: NtStatus)
    {
        self.exit_status.lock().get_or_insert(status);
        self.rundown.close();
        for thread in self.threads() {
            thread.begin_exit(status);
        }
    }

    pub fn is_terminating(&self) -> bool
    {
        self.rundown.is_closed()
    }

    pub fn exit_status(&self) -> Option<NtStatus>
    {
        *self.exit_status.lock()
    }

    /// Children created from this process don't inherit its binding.
    pub fn no_debug_inherit(&self) -> bool
    {
        self.flags.load(Ordering::Acquire) & NO_DEBUG_INHERIT != 0
    }

    pub fn set_no_debug_inherit(&self)
    {
        self.flags.fetch_or(NO_DEBUG_INHERIT, Ordering::AcqRel);
    }

    /// The process-create event has been reported (or synthesized by attach).
    pub fn create_reported(&self) -> bool
    {
        self.flags.load(Ordering::Acquire) & CREATE_REPORTED != 0
    }

    /// Set the create-reported flag, returning whether it was already set.
    pub(crate) fn mark_create_reported(&self) -> bool
    {
        self.flags.fetch_or(CREATE_REPORTED, Ordering::AcqRel) & CREATE_REPORTED != 0
    }

    /// Set the image-notified flag, returning whether it was already set.
    pub(crate) fn mark_image_notified(&self) -> bool
    {
        self.flags.fetch_or(IMAGE_NOTIFY_DONE, Ordering::AcqRel) & IMAGE_NOTIFY_DONE != 0
    }

    /// Append an image to the loader list (what the loader does on map).
    pub fn map_image(&self, image: MappedImage)
    {
        if let Some(space) = self.address_space.lock().as_mut() {
            space.modules.push(image);
        }
    }

    /// Remove the image at `base` from the loader list.
    pub fn unmap_image(&self, base: Address) -> Option<MappedImage>
    {
        let mut guard = self.address_space.lock();
        let space = guard.as_mut()?;
        let index = space.modules.iter().position(|image| image.base == base)?;
        Some(space.modules.remove(index))
    }

    pub(crate) fn rundown(&self) -> &RundownProtection
    {
        &self.rundown
    }
}
