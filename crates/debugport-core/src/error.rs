//! # Error Types
//!
//! Error handling for broker operations.
//!
//! We use `thiserror` to generate the `Error` implementations. Every variant
//! also maps onto the kernel status a native caller would have seen, see
//! [`BrokerError::status`].

use thiserror::Error;

use crate::types::{Handle, NtStatus, ProcessId, ThreadId};

/// Main error type for broker operations
///
/// ## Error Categories
///
/// 1. **Policy rejections**: InvalidParameter, InfoLengthMismatch, AccessDenied,
///    InvalidHandle, ObjectTypeMismatch. Raised before any state is mutated.
/// 2. **Race losses**: PortAlreadySet (another attach won), PortNotSet (the
///    process is not, or no longer, bound).
/// 3. **Liveness failures**: ProcessTerminating, ThreadTerminating,
///    ProcessNotFound.
/// 4. **Teardown**: SessionInactive (enqueue refused on a deleting session),
///    DebuggerInactive (producer released or wait failed by teardown).
#[derive(Error, Debug)]
pub enum BrokerError
{
    /// An argument was outside the accepted set
    ///
    /// Examples:
    /// - Unknown session flag bits
    /// - A continue status that isn't one of the `DBG_*` reply codes
    /// - Continuing a thread whose event was never delivered
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The handle is not present in the object table
    #[error("Invalid handle {0}")]
    InvalidHandle(Handle),

    /// The handle refers to an object of another type
    #[error("Handle {handle} is not a {expected} handle")]
    ObjectTypeMismatch
    {
        /// Handle that was looked up
        handle: Handle,
        /// Object type the caller needed
        expected: &'static str,
    },

    /// A fixed-size information buffer had the wrong length
    #[error("Information length mismatch: expected {expected} bytes, got {actual}")]
    InfoLengthMismatch
    {
        /// Required buffer size
        expected: usize,
        /// Size supplied by the caller
        actual: usize,
    },

    /// The operation is not allowed on this target
    ///
    /// Attaching to the system process is refused with this error.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The process is not bound to the session (or to any session)
    #[error("Debug port not set")]
    PortNotSet,

    /// Another session was bound to the process first
    ///
    /// Two concurrent attaches to one process: exactly one installs its
    /// binding, the other gets this error and leaves nothing behind.
    #[error("Debug port already set")]
    PortAlreadySet,

    /// The session is being deleted and refuses new events
    #[error("Debug session is inactive")]
    SessionInactive,

    /// The debugger went away
    ///
    /// Returned to producers that were blocked when the session was torn down
    /// or the process was detached, and to waiters on a deleting session.
    #[error("Debugger inactive")]
    DebuggerInactive,

    /// The target process is exiting and can't be held alive
    #[error("Process {0} is terminating")]
    ProcessTerminating(ProcessId),

    /// The target thread is exiting and can't be held alive
    #[error("Thread {0} is terminating")]
    ThreadTerminating(ThreadId),

    /// No process with the given id exists
    #[error("Process not found: PID {0}")]
    ProcessNotFound(ProcessId),

    /// Generic failure with a description
    #[error("Operation failed: {0}")]
    Unsuccessful(String),
}

impl BrokerError
{
    /// The kernel status equivalent of this error.
    ///
    /// Both teardown variants report `DEBUGGER_INACTIVE`, so every caller
    /// touching a deleting session sees the same status.
    ///
    /// ```rust
    /// use debugport_core::error::BrokerError;
    /// use debugport_core::types::NtStatus;
    ///
    /// assert_eq!(BrokerError::PortAlreadySet.status(), NtStatus::PORT_ALREADY_SET);
    /// assert_eq!(BrokerError::SessionInactive.status(), NtStatus::DEBUGGER_INACTIVE);
    /// ```
    #[must_use]
    pub fn status(&self) -> NtStatus
    {
        match self {
            Self::InvalidParameter(_) => NtStatus::INVALID_PARAMETER,
            Self::InvalidHandle(_) => NtStatus::INVALID_HANDLE,
            Self::ObjectTypeMismatch { .. } => NtStatus::OBJECT_TYPE_MISMATCH,
            Self::InfoLengthMismatch { .. } => NtStatus::INFO_LENGTH_MISMATCH,
            Self::AccessDenied(_) => NtStatus::ACCESS_DENIED,
            Self::PortNotSet => NtStatus::PORT_NOT_SET,
            Self::PortAlreadySet => NtStatus::PORT_ALREADY_SET,
            Self::SessionInactive | Self::DebuggerInactive => NtStatus::DEBUGGER_INACTIVE,
            Self::ProcessTerminating(_) => NtStatus::PROCESS_IS_TERMINATING,
            Self::ThreadTerminating(_) => NtStatus::THREAD_IS_TERMINATING,
            Self::ProcessNotFound(_) => NtStatus::INVALID_CID,
            Self::Unsuccessful(_) => NtStatus::UNSUCCESSFUL,
        }
    }
}

/// Convenience type alias for `Result<T, BrokerError>`
///
/// ```rust
/// use debugport_core::error::BrokerResult;
/// fn foo() -> BrokerResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
