//! Process, thread and handle identifiers.

use std::fmt;

/// Process identifier (PID)
///
/// PIDs handed out by the process table are never reused for the lifetime of
/// a broker, so a `ProcessId` is a stable key for the binding table.
///
/// ## Example
///
/// ```rust
/// use debugport_core::types::ProcessId;
///
/// let pid = ProcessId::from(1234);
/// assert_eq!(u32::from(pid), 1234);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// Thread ids increase monotonically across the whole system. The ordering is
/// what the "next thread after X" cursor relies on: a thread created after the
/// cursor was taken always sorts after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    ///
    /// ```rust
    /// use debugport_core::types::ThreadId;
    ///
    /// let thread = ThreadId::from(12345);
    /// assert_eq!(thread.raw(), 12345);
    /// ```
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// The (process, thread) pair identifying the producer of a debug event.
///
/// Copied into every event record when it is queued and used by the debugger
/// to name the thread it wants to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId
{
    /// Owning process
    pub process: ProcessId,
    /// Producing thread
    pub thread: ThreadId,
}

impl ClientId
{
    /// Build a client id from its parts.
    pub const fn new(process: ProcessId, thread: ThreadId) -> Self
    {
        Self { process, thread }
    }
}

impl fmt::Display for ClientId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}.{}", self.process, self.thread)
    }
}

/// Opaque handle into the broker's object table.
///
/// Handles are never zero, so `Option<Handle>` is used wherever the kernel
/// would report a null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u64);

impl Handle
{
    /// Get the raw handle value
    pub fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for Handle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}
