//! Kernel status codes and debugger reply codes.

use std::fmt;

use crate::error::BrokerError;

/// A raw kernel status value.
///
/// Severity lives in the top two bits: values with the high bit clear are
/// successes (including informational and the `DBG_*` reply codes below
/// `0x8000_0000`), values with it set are warnings or errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus
{
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const ALERTED: Self = Self(0x0000_0101);
    pub const TIMEOUT: Self = Self(0x0000_0102);
    pub const BREAKPOINT: Self = Self(0x8000_0003);
    pub const SINGLE_STEP: Self = Self(0x8000_0004);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001);
    pub const INFO_LENGTH_MISMATCH: Self = Self(0xC000_0004);
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005);
    pub const INVALID_HANDLE: Self = Self(0xC000_0008);
    pub const INVALID_CID: Self = Self(0xC000_000B);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const ACCESS_DENIED: Self = Self(0xC000_0022);
    pub const OBJECT_TYPE_MISMATCH: Self = Self(0xC000_0024);
    pub const PORT_ALREADY_SET: Self = Self(0xC000_0048);
    pub const THREAD_IS_TERMINATING: Self = Self(0xC000_004B);
    pub const PROCESS_IS_TERMINATING: Self = Self(0xC000_010A);
    pub const PORT_NOT_SET: Self = Self(0xC000_0353);
    pub const DEBUGGER_INACTIVE: Self = Self(0xC000_0354);

    /// Whether the status denotes success (high bit clear).
    pub const fn is_success(self) -> bool
    {
        self.0 & 0x8000_0000 == 0
    }
}

impl fmt::Display for NtStatus
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<u32> for NtStatus
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

/// Reply a debugger hands back with `continue`.
///
/// The discriminants are the wire values debuggers pass; any other value is
/// rejected before the session is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ContinueStatus
{
    /// The debugger handled the exception.
    ExceptionHandled = 0x0001_0001,
    /// Resume the thread.
    Continue = 0x0001_0002,
    /// Terminate the reporting thread.
    TerminateThread = 0x4001_0003,
    /// Terminate the reporting process.
    TerminateProcess = 0x4001_0004,
    /// Pass the exception on to the next handler.
    ExceptionNotHandled = 0x8001_0001,
}

impl ContinueStatus
{
    /// The raw wire value.
    pub const fn code(self) -> u32
    {
        self as u32
    }
}

impl TryFrom<u32> for ContinueStatus
{
    type Error = BrokerError;

    fn try_from(value: u32) -> Result<Self, Self::Error>
    {
        match value {
            0x0001_0001 => Ok(Self::ExceptionHandled),
            0x0001_0002 => Ok(Self::Continue),
            0x4001_0003 => Ok(Self::TerminateThread),
            0x4001_0004 => Ok(Self::TerminateProcess),
            0x8001_0001 => Ok(Self::ExceptionNotHandled),
            other => Err(BrokerError::InvalidParameter(format!("continue status 0x{other:08X}"))),
        }
    }
}

impl From<ContinueStatus> for NtStatus
{
    fn from(status: ContinueStatus) -> Self
    {
        NtStatus(status.code())
    }
}

impl fmt::Display for ContinueStatus
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::ExceptionHandled => "DBG_EXCEPTION_HANDLED",
            Self::Continue => "DBG_CONTINUE",
            Self::TerminateThread => "DBG_TERMINATE_THREAD",
            Self::TerminateProcess => "DBG_TERMINATE_PROCESS",
            Self::ExceptionNotHandled => "DBG_EXCEPTION_NOT_HANDLED",
        };
        f.write_str(name)
    }
}
