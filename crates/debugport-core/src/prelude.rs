//! Common module for library exports

pub use crate::broker::{
    Alert, Broker, BrokerBuilder, EventKind, ExceptionRecord, SessionFlags, SessionInfoClass, StateInfo, WaitOutcome,
    WaitStateChange,
};
pub use crate::config::BrokerConfig;
pub use crate::error::{BrokerError, BrokerResult};
pub use crate::platform::{MappedImage, Process, ProcessSpec, Thread, ThreadSpec};
pub use crate::types::{Address, ClientId, ContinueStatus, Handle, NtStatus, ProcessId, ThreadId};
