//! # debugport-core
//!
//! A debug event broker: the component that sits between debuggers and the
//! processes they observe.
//!
//! This crate provides:
//! - Debug sessions with an ordered event queue and a "may have events" signal
//! - Process-to-session bindings with race-safe attach and detach
//! - `wait_for_event` / `continue_event` for the debugger side
//! - Target-side producers for thread, process, module and exception events
//! - An in-memory model of the kernel services the broker consumes
//!   (processes, threads, liveness holds, handles, image metadata)
//!
//! ## Concurrency
//!
//! Every public type is `Send + Sync`. Producers block the calling thread
//! until the debugger answers; waits block until an event is deliverable,
//! a timeout elapses or an alert is raised.

pub mod broker;
pub mod config;
pub mod error;
pub mod object;
pub mod platform;
pub mod prelude;
pub mod types;

pub use broker::{Broker, BrokerBuilder, WaitOutcome};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
