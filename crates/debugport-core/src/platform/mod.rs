//! # Kernel Services
//!
//! In-memory implementations of the kernel services the broker consumes:
//!
//! - **process / table**: processes, threads, the process list and their
//!   stable "next" cursors
//! - **rundown**: liveness holds that fail once the owner is exiting
//! - **guards**: RAII thread suspension
//! - **image**: mapped images, file objects and the image resolver seam
//! - **address_space**: scoped adoption of a target's address space
//!
//! The broker only uses the narrow surface exported here, so a real kernel
//! backend can replace this module without touching `broker`.

pub mod address_space;
pub mod guards;
pub mod image;
pub mod process;
pub mod rundown;
pub mod table;

pub use address_space::{AddressSpace, AddressSpaceView};
pub use guards::{ProcessFreeze, ThreadSuspension};
pub use image::{FileObject, ImageHeaders, ImageNotifyCallback, ImageResolver, LoaderImageResolver, MappedImage};
pub use process::{Process, ProcessHold, ProcessSpec, Thread, ThreadHold, ThreadSpec, THREAD_ALL_ACCESS};
pub use rundown::RundownProtection;
pub use table::{ProcessTable, SYSTEM_PROCESS_ID};
