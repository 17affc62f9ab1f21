//! # Types
//!
//! Identity and status types shared by the broker and the kernel services it
//! consumes.
//!
//! These are deliberately small `Copy` newtypes: a record keeps a copy of its
//! producer's identity so the identity outlives the producer's teardown.

pub mod address;
pub mod ids;
pub mod status;

// Re-export all public types
pub use address::Address;
pub use ids::{ClientId, Handle, ProcessId, ThreadId};
pub use status::{ContinueStatus, NtStatus};
