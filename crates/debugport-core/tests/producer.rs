//! Target-side reporting: launches, exceptions, module maps, exits and detach.

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use common::*;
use debugport_core::broker::{Broker, ExceptionRecord, StateInfo};
use debugport_core::config::BrokerConfig;
use debugport_core::error::BrokerError;
use debugport_core::platform::{
    AddressSpaceView, FileObject, ImageHeaders, ImageResolver, MappedImage, ProcessSpec, ThreadSpec,
};
use debugport_core::types::{Address, ContinueStatus, NtStatus};

fn breakpoint() -> ExceptionRecord
{
    ExceptionRecord::new(NtStatus::BREAKPOINT, Address::new(0x0040_1000))
}

#[derive(Debug)]
struct NothingResolves;

impl ImageResolver for NothingResolves
{
    fn open_file(&self, _image: &MappedImage) -> Option<Arc<FileObject>>
    {
        None
    }

    fn read_headers(&self, _image: &MappedImage) -> Option<ImageHeaders>
    {
        None
    }
}

#[test]
fn test_image_notify_runs_once_without_debugger()
{
    let notified = Arc::new(AtomicUsize::new(0));
    let broker = {
        let notified = Arc::clone(&notified);
        Broker::builder()
            .on_image_notify(move |_, image| {
                assert_eq!(image.base, Address::new(MAIN_BASE));
                notified.fetch_add(1, Ordering::SeqCst);
            })
            .build()
    };
    let process = broker.create_process(ProcessSpec::new("target").with_image(main_image()), None);

    for _ in 0..2 {
        let thread = process.spawn_thread(ThreadSpec::new(Address::new(0x0040_1000))).unwrap();
        let err = broker.report_thread_start(&process, &thread).unwrap_err();
        assert!(matches!(err, BrokerError::PortNotSet));
        assert_eq!(err.status(), NtStatus::PORT_NOT_SET);
    }
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    // Nobody saw a process-create, so a later debugger still needs one.
    assert!(!process.create_reported());
}

#[test]
fn test_launched_process_reports_its_own_creates()
{
    let broker = Arc::new(Broker::new());
    let session = broker.create_session(0).unwrap();
    let process = broker
        .create_debugged_process(ProcessSpec::new("target").with_image(main_image()), session)
        .unwrap();

    let initial = process.spawn_thread(ThreadSpec::new(Address::new(0x0040_1000))).unwrap();
    let producer = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&process);
        let thread = Arc::clone(&initial);
        thread::spawn(move || broker.report_thread_start(&process, &thread))
    };
    let event = next_event(&broker, session);
    assert_eq!(event.client_id, initial.client_id());
    let StateInfo::CreateProcess {
        file,
        base_of_image,
        debug_info_file_offset,
        debug_info_size,
        start_address,
        ..
    } = event.info
    else {
        panic!("expected a process-create, got {}", event.info);
    };
    assert_eq!(broker.handles().file(file.unwrap()).unwrap().path(), Path::new("/bin/target"));
    assert_eq!(base_of_image, Address::new(MAIN_BASE));
    assert_eq!((debug_info_file_offset, debug_info_size), (0x200, 16));
    assert_eq!(start_address, Some(Address::new(0x0040_1000)));
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    assert_eq!(producer.join().unwrap().unwrap(), ContinueStatus::Continue);

    let worker = process.spawn_thread(ThreadSpec::new(Address::new(0x0040_5000))).unwrap();
    let producer = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&process);
        let thread = Arc::clone(&worker);
        thread::spawn(move || broker.report_thread_start(&process, &thread))
    };
    let event = next_event(&broker, session);
    let StateInfo::CreateThread { thread, start_address } = event.info else {
        panic!("expected a thread-create, got {}", event.info);
    };
    assert_eq!(broker.handles().thread(thread).unwrap().id(), worker.id());
    assert_eq!(start_address, Address::new(0x0040_5000));

    // Siblings stay frozen for the round trip.
    assert_eq!(initial.suspend_count(), 1);
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    producer.join().unwrap().unwrap();
    assert_eq!(initial.suspend_count(), 0);
}

#[test]
fn test_freeze_can_be_disabled()
{
    let broker = Arc::new(
        Broker::builder()
            .config(BrokerConfig {
                freeze_on_report: false,
                ..BrokerConfig::default()
            })
            .build(),
    );
    let target = running_process(&broker, 2, 0);
    let session = attach_new_session(&broker, &target.process, 0);
    drain(&broker, session);

    let producer = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&target.process);
        let thread = Arc::clone(&target.threads[1]);
        thread::spawn(move || broker.report_module_unload(&process, &thread, Address::new(0x7ff0_0000)))
    };
    let event = next_event(&broker, session);
    assert_eq!(target.threads[0].suspend_count(), 0);
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    producer.join().unwrap().unwrap();
}

#[test]
fn test_unbound_and_hidden_threads_report_nothing()
{
    let broker = Broker::new();
    let target = running_process(&broker, 2, 0);
    let err = broker
        .report_exception(&target.process, &target.threads[0], breakpoint(), true)
        .unwrap_err();
    assert!(matches!(err, BrokerError::PortNotSet));

    let session = attach_new_session(&broker, &target.process, 0);
    drain(&broker, session);

    let hidden = &target.threads[1];
    hidden.hide_from_debugger();
    let err = broker.report_exception(&target.process, hidden, breakpoint(), true).unwrap_err();
    assert!(matches!(err, BrokerError::PortNotSet));
    assert_eq!(broker.handles().session(session).unwrap().queued_events(), 0);
    assert_eq!(target.threads[0].suspend_count(), 0);
}

#[test]
fn test_module_map_and_unmap_are_reported()
{
    let broker = Arc::new(Broker::new());
    let target = running_process(&broker, 2, 0);
    let session = attach_new_session(&broker, &target.process, 0);
    drain(&broker, session);

    let image = module(7);
    let producer = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&target.process);
        let thread = Arc::clone(&target.threads[1]);
        let image = image.clone();
        thread::spawn(move || broker.map_image(&process, &thread, image))
    };
    let event = next_event(&broker, session);
    let StateInfo::LoadDll {
        file,
        base,
        debug_info_file_offset,
        debug_info_size,
    } = event.info
    else {
        panic!("expected a module load, got {}", event.info);
    };
    assert_eq!(base, image.base);
    assert_eq!((debug_info_file_offset, debug_info_size), (0x200, 16));
    assert_eq!(broker.handles().file(file.unwrap()).unwrap().path(), Path::new("/lib/module7.so"));
    assert_eq!(target.threads[0].suspend_count(), 1);
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    assert_eq!(producer.join().unwrap(), Some(ContinueStatus::Continue));
    assert_eq!(target.threads[0].suspend_count(), 0);

    let loaded = AddressSpaceView::adopt(&target.process).unwrap().loaded_modules().len();
    assert_eq!(loaded, 2);

    let producer = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&target.process);
        let thread = Arc::clone(&target.threads[1]);
        let base = image.base;
        thread::spawn(move || broker.unmap_image(&process, &thread, base))
    };
    let event = next_event(&broker, session);
    assert_eq!(event.info, StateInfo::UnloadDll { base: image.base });
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    assert_eq!(producer.join().unwrap(), Some(ContinueStatus::Continue));

    // Unmapping something that isn't mapped reports nothing.
    assert_eq!(broker.unmap_image(&target.process, &target.threads[1], image.base), None);
}

#[test]
fn test_module_map_without_debugger_only_updates_loader_list()
{
    let broker = Broker::new();
    let target = running_process(&broker, 1, 0);
    assert_eq!(broker.map_image(&target.process, &target.threads[0], module(3)), None);

    let view = AddressSpaceView::adopt(&target.process).unwrap();
    assert_eq!(view.loaded_modules().last(), Some(&module(3)));
}

#[test]
fn test_custom_resolver_is_used()
{
    let broker = Broker::builder().resolver(NothingResolves).build();
    let target = running_process(&broker, 1, 1);
    let session = attach_new_session(&broker, &target.process, 0);

    let events = drain(&broker, session);
    assert_eq!(events.len(), 2);
    for event in &events {
        assert!(event.info.handles().iter().all(|handle| broker.handles().file(*handle).is_err()));
    }
}

#[test]
fn test_caught_up_thread_does_not_report_again()
{
    let broker = Broker::new();
    let process = broker.create_process(ProcessSpec::new("target").with_image(main_image()), None);
    let initial = process.spawn_thread(ThreadSpec::new(Address::new(0x0040_1000))).unwrap();
    assert!(broker.report_thread_start(&process, &initial).is_err());
    // Created, but not yet running its start hook.
    let late = process.spawn_thread(ThreadSpec::new(Address::new(0x0040_2000))).unwrap();

    let session = attach_new_session(&broker, &process, 0);
    assert_eq!(drain(&broker, session).len(), 2);

    assert!(late.skips_creation_report());
    let err = broker.report_thread_start(&process, &late).unwrap_err();
    assert!(matches!(err, BrokerError::PortNotSet));
    assert_eq!(broker.handles().session(session).unwrap().queued_events(), 0);
}

#[test]
fn test_start_after_attach_reports_thread_create()
{
    let broker = Arc::new(Broker::new());
    let target = running_process(&broker, 1, 0);
    assert!(!target.process.create_reported());

    let session = attach_new_session(&broker, &target.process, 0);
    let caught_up = drain(&broker, session);
    assert_eq!(caught_up.len(), 1);
    assert!(is_create_process(&caught_up[0]));
    assert!(target.process.create_reported());

    let late = target.process.spawn_thread(ThreadSpec::new(Address::new(0x0040_2000))).unwrap();
    let producer = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&target.process);
        let late = Arc::clone(&late);
        thread::spawn(move || broker.report_thread_start(&process, &late))
    };

    let event = next_event(&broker, session);
    assert!(is_create_thread(&event));
    assert_eq!(event.client_id, late.client_id());
    assert_eq!(target.threads[0].suspend_count(), 1);
    continue_with(&broker, session, &event, ContinueStatus::Continue);

    assert_eq!(producer.join().unwrap().unwrap(), ContinueStatus::Continue);
    assert_eq!(target.threads[0].suspend_count(), 0);
    assert!(drain(&broker, session).is_empty());
}

#[test]
fn test_thread_and_process_exit()
{
    let broker = Arc::new(Broker::new());
    let target = running_process(&broker, 2, 0);
    let pid = target.process.id();
    let session = attach_new_session(&broker, &target.process, 0);
    drain(&broker, session);

    let worker = Arc::clone(&target.threads[1]);
    let exiting = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&target.process);
        let thread = Arc::clone(&worker);
        thread::spawn(move || broker.exit_thread(&process, &thread, NtStatus(7)))
    };
    let event = next_event(&broker, session);
    assert_eq!(event.client_id, worker.client_id());
    assert_eq!(event.info, StateInfo::ExitThread { exit_status: NtStatus(7) });
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    exiting.join().unwrap();
    assert!(worker.is_terminating());
    assert_eq!(target.process.thread_count(), 1);

    let last = Arc::clone(&target.threads[0]);
    let exiting = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&target.process);
        let thread = Arc::clone(&last);
        thread::spawn(move || broker.exit_thread(&process, &thread, NtStatus::SUCCESS))
    };
    let event = next_event(&broker, session);
    assert_eq!(event.client_id, last.client_id());
    assert_eq!(event.info, StateInfo::ExitProcess { exit_status: NtStatus::SUCCESS });
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    exiting.join().unwrap();

    assert!(target.process.is_terminating());
    assert_eq!(target.process.exit_status(), Some(NtStatus::SUCCESS));
    assert!(!broker.is_debugged(pid));
    assert!(broker.processes().get(pid).is_none());
}

#[test]
fn test_detach_releases_blocked_producer()
{
    let broker = Arc::new(Broker::new());
    let target = running_process(&broker, 1, 0);
    let session = attach_new_session(&broker, &target.process, 0);
    drain(&broker, session);

    let producer = {
        let broker = Arc::clone(&broker);
        let process = Arc::clone(&target.process);
        let thread = Arc::clone(&target.threads[0]);
        thread::spawn(move || broker.report_exception(&process, &thread, breakpoint(), true))
    };
    let state = broker.handles().session(session).unwrap();
    wait_until(|| state.queued_events() == 1);

    let process = broker.open_process(target.process.id()).unwrap();
    let other = broker.create_session(0).unwrap();
    assert!(matches!(broker.detach(process, other), Err(BrokerError::PortNotSet)));

    broker.detach(process, session).unwrap();
    assert!(matches!(producer.join().unwrap(), Err(BrokerError::DebuggerInactive)));
    assert_eq!(state.queued_events(), 0);
    assert!(!broker.is_debugged(target.process.id()));
    assert!(!AddressSpaceView::adopt(&target.process).unwrap().being_debugged());

    assert!(matches!(broker.detach(process, session), Err(BrokerError::PortNotSet)));

    // Detached processes can be attached again.
    broker.attach(process, other).unwrap();
    assert_eq!(drain(&broker, other).len(), 1);
}
