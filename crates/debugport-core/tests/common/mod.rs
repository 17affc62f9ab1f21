//! Shared fixtures for the broker integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use debugport_core::broker::{Broker, StateInfo, WaitOutcome, WaitStateChange};
use debugport_core::platform::{ImageHeaders, MappedImage, Process, ProcessSpec, Thread, ThreadSpec};
use debugport_core::types::{Address, ContinueStatus, Handle};

/// Generous upper bound for anything that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(5);

/// Wait used when the queue is expected to be quiet.
pub const QUIET: Duration = Duration::from_millis(50);

pub const MAIN_BASE: u64 = 0x0040_0000;
pub const ENTRY_RVA: u64 = 0x1000;

pub fn headers() -> ImageHeaders
{
    ImageHeaders {
        symbol_table_offset: 0x200,
        symbol_count: 16,
        entry_point_rva: ENTRY_RVA,
    }
}

pub fn main_image() -> MappedImage
{
    MappedImage::new(Address::new(MAIN_BASE), 0x10_000)
        .with_path("/bin/target")
        .with_headers(headers())
}

pub fn module(index: u64) -> MappedImage
{
    MappedImage::new(Address::new(0x7ff0_0000_0000 + index * 0x10_0000), 0x8000)
        .with_path(format!("/lib/module{index}.so"))
        .with_headers(headers())
}

pub struct Target
{
    pub process: Arc<Process>,
    pub threads: Vec<Arc<Thread>>,
}

/// A process whose threads have all started (and reported, to nobody).
pub fn running_process(broker: &Broker, threads: usize, modules: u64) -> Target
{
    let process = broker.create_process(ProcessSpec::new("target").with_image(main_image()), None);
    for index in 0..modules {
        process.map_image(module(index));
    }
    let threads = (0..threads)
        .map(|index| {
            let thread = process
                .spawn_thread(ThreadSpec::new(Address::new(0x0040_1000 + index as u64 * 0x100)))
                .unwrap();
            assert!(broker.report_thread_start(&process, &thread).is_err());
            thread
        })
        .collect();
    Target { process, threads }
}

/// Create a session and attach it to `process`.
pub fn attach_new_session(broker: &Broker, process: &Process, flags: u32) -> Handle
{
    let session = broker.create_session(flags).unwrap();
    let target = broker.open_process(process.id()).unwrap();
    broker.attach(target, session).unwrap();
    broker.close_handle(target).unwrap();
    session
}

pub fn next_event(broker: &Broker, session: Handle) -> WaitStateChange
{
    match broker.wait_for_event(session, Some(WAIT), None).unwrap() {
        WaitOutcome::Event(event) => event,
        other => panic!("expected an event, got {other:?}"),
    }
}

pub fn continue_with(broker: &Broker, session: Handle, event: &WaitStateChange, status: ContinueStatus)
{
    broker.continue_event(session, event.client_id, status.code()).unwrap();
}

/// Deliver and continue everything until the session is quiet.
pub fn drain(broker: &Broker, session: Handle) -> Vec<WaitStateChange>
{
    let mut events = Vec::new();
    while let WaitOutcome::Event(event) = broker.wait_for_event(session, Some(QUIET), None).unwrap() {
        continue_with(broker, session, &event, ContinueStatus::Continue);
        events.push(event);
    }
    events
}

pub fn is_create_process(event: &WaitStateChange) -> bool
{
    matches!(event.info, StateInfo::CreateProcess { .. })
}

pub fn is_create_thread(event: &WaitStateChange) -> bool
{
    matches!(event.info, StateInfo::CreateThread { .. })
}

pub fn is_load_dll(event: &WaitStateChange) -> bool
{
    matches!(event.info, StateInfo::LoadDll { .. })
}

/// Poll `condition` until it holds or `WAIT` passes.
pub fn wait_until(mut condition: impl FnMut() -> bool)
{
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
