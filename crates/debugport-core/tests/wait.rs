//! Waiting for and continuing events.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use debugport_core::broker::{Alert, Broker, ExceptionRecord, StateInfo, WaitOutcome};
use debugport_core::error::BrokerError;
use debugport_core::platform::{Process, Thread};
use debugport_core::types::{Address, ContinueStatus, Handle, NtStatus};

type Producer = thread::JoinHandle<Result<ContinueStatus, BrokerError>>;

fn raise(broker: &Arc<Broker>, process: &Arc<Process>, thread: &Arc<Thread>, code: NtStatus) -> Producer
{
    let broker = Arc::clone(broker);
    let process = Arc::clone(process);
    let thread = Arc::clone(thread);
    thread::spawn(move || {
        let record = ExceptionRecord::new(code, Address::new(0x0040_1234));
        broker.report_exception(&process, &thread, record, true)
    })
}

/// An attached process with its catch-up already answered.
fn quiet_target(broker: &Broker, threads: usize) -> (Target, Handle)
{
    let target = running_process(broker, threads, 0);
    let session = attach_new_session(broker, &target.process, 0);
    drain(broker, session);
    (target, session)
}

fn queued(broker: &Broker, session: Handle) -> usize
{
    broker.handles().session(session).unwrap().queued_events()
}

#[test]
fn test_empty_session_times_out()
{
    let broker = Broker::new();
    let session = broker.create_session(0).unwrap();

    let outcome = broker.wait_for_event(session, Some(Duration::ZERO), None).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);

    let started = Instant::now();
    let outcome = broker.wait_for_event(session, Some(QUIET), None).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(started.elapsed() >= QUIET);
}

#[test]
fn test_wait_rejects_bad_handles()
{
    let broker = Broker::new();
    let target = running_process(&broker, 1, 0);
    let process = broker.open_process(target.process.id()).unwrap();

    assert!(matches!(
        broker.wait_for_event(process, Some(Duration::ZERO), None),
        Err(BrokerError::ObjectTypeMismatch { .. })
    ));
    assert!(matches!(
        broker.wait_for_event(Handle(0x7777), Some(Duration::ZERO), None),
        Err(BrokerError::InvalidHandle(_))
    ));
}

#[test]
fn test_alert_interrupts_alertable_wait()
{
    let broker = Arc::new(Broker::new());
    let session = broker.create_session(0).unwrap();
    let alert = Alert::new();

    let waiter = {
        let broker = Arc::clone(&broker);
        let alert = alert.clone();
        thread::spawn(move || broker.wait_for_event(session, None, Some(&alert)))
    };
    thread::sleep(Duration::from_millis(50));
    alert.raise();

    assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::Alerted);
    assert!(!alert.is_pending());
}

#[test]
fn test_pending_alert_is_consumed_once()
{
    let broker = Broker::new();
    let session = broker.create_session(0).unwrap();
    let alert = Alert::new();
    alert.raise();
    assert!(alert.is_pending());

    // A wait that isn't alertable leaves the alert alone.
    let outcome = broker.wait_for_event(session, Some(Duration::ZERO), None).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(alert.is_pending());

    let outcome = broker.wait_for_event(session, Some(WAIT), Some(&alert)).unwrap();
    assert_eq!(outcome, WaitOutcome::Alerted);

    let outcome = broker.wait_for_event(session, Some(QUIET), Some(&alert)).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[test]
fn test_ready_event_wins_over_pending_alert()
{
    let broker = Arc::new(Broker::new());
    let (target, session) = quiet_target(&broker, 1);
    let producer = raise(&broker, &target.process, &target.threads[0], NtStatus::ACCESS_VIOLATION);
    wait_until(|| queued(&broker, session) == 1);

    let alert = Alert::new();
    alert.raise();
    let event = broker
        .wait_for_event(session, Some(WAIT), Some(&alert))
        .unwrap()
        .into_event()
        .unwrap();
    assert!(alert.is_pending());

    continue_with(&broker, session, &event, ContinueStatus::ExceptionHandled);
    assert_eq!(producer.join().unwrap().unwrap(), ContinueStatus::ExceptionHandled);

    assert_eq!(
        broker.wait_for_event(session, Some(WAIT), Some(&alert)).unwrap(),
        WaitOutcome::Alerted
    );
    assert_eq!(queued(&broker, session), 0);
}

#[test]
fn test_exception_codes_are_classified()
{
    let broker = Arc::new(Broker::new());
    let (target, session) = quiet_target(&broker, 1);
    let thread = &target.threads[0];

    for code in [NtStatus::BREAKPOINT, NtStatus::SINGLE_STEP, NtStatus::ACCESS_VIOLATION] {
        let producer = raise(&broker, &target.process, thread, code);
        let event = next_event(&broker, session);
        match (&event.info, code) {
            (StateInfo::Breakpoint(info), NtStatus::BREAKPOINT)
            | (StateInfo::SingleStep(info), NtStatus::SINGLE_STEP)
            | (StateInfo::Exception(info), NtStatus::ACCESS_VIOLATION) => {
                assert_eq!(info.record.code, code);
                assert_eq!(info.record.address, Address::new(0x0040_1234));
                assert!(info.first_chance);
            }
            (other, code) => panic!("{code} classified as {other}"),
        }
        assert!(event.describe().contains(&event.client_id.to_string()));
        continue_with(&broker, session, &event, ContinueStatus::ExceptionNotHandled);
        assert_eq!(producer.join().unwrap().unwrap(), ContinueStatus::ExceptionNotHandled);
    }
}

#[test]
fn test_continue_rejects_unknown_status()
{
    let broker = Arc::new(Broker::new());
    let (target, session) = quiet_target(&broker, 1);
    let producer = raise(&broker, &target.process, &target.threads[0], NtStatus::BREAKPOINT);
    let event = next_event(&broker, session);

    let err = broker.continue_event(session, event.client_id, 0x1234).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidParameter(_)));
    assert!(!producer.is_finished());

    continue_with(&broker, session, &event, ContinueStatus::Continue);
    assert_eq!(producer.join().unwrap().unwrap(), ContinueStatus::Continue);
}

#[test]
fn test_continue_requires_a_delivered_event()
{
    let broker = Arc::new(Broker::new());
    let (target, session) = quiet_target(&broker, 1);
    let thread = &target.threads[0];
    let producer = raise(&broker, &target.process, thread, NtStatus::BREAKPOINT);
    wait_until(|| queued(&broker, session) == 1);

    let err = broker
        .continue_event(session, thread.client_id(), ContinueStatus::Continue.code())
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidParameter(_)));
    assert_eq!(queued(&broker, session), 1);

    let event = next_event(&broker, session);
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    producer.join().unwrap().unwrap();

    // A second continue finds nothing to answer.
    let err = broker
        .continue_event(session, event.client_id, ContinueStatus::Continue.code())
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidParameter(_)));
}

#[test]
fn test_same_process_events_are_serialized()
{
    let broker = Arc::new(Broker::new());
    let (target, session) = quiet_target(&broker, 2);

    let first = raise(&broker, &target.process, &target.threads[0], NtStatus::BREAKPOINT);
    wait_until(|| queued(&broker, session) == 1);
    let second = raise(&broker, &target.process, &target.threads[1], NtStatus::SINGLE_STEP);
    wait_until(|| queued(&broker, session) == 2);

    let event = next_event(&broker, session);
    assert_eq!(event.client_id, target.threads[0].client_id());
    let outcome = broker.wait_for_event(session, Some(QUIET), None).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);

    continue_with(&broker, session, &event, ContinueStatus::Continue);
    first.join().unwrap().unwrap();

    let event = next_event(&broker, session);
    assert_eq!(event.client_id, target.threads[1].client_id());
    assert!(matches!(event.info, StateInfo::SingleStep(_)));
    continue_with(&broker, session, &event, ContinueStatus::Continue);
    second.join().unwrap().unwrap();
}

#[test]
fn test_events_of_different_processes_interleave()
{
    let broker = Arc::new(Broker::new());
    let first = running_process(&broker, 1, 0);
    let second = running_process(&broker, 1, 0);
    let session = attach_new_session(&broker, &first.process, 0);
    let process = broker.open_process(second.process.id()).unwrap();
    broker.attach(process, session).unwrap();
    drain(&broker, session);

    let producers = [
        raise(&broker, &first.process, &first.threads[0], NtStatus::BREAKPOINT),
        raise(&broker, &second.process, &second.threads[0], NtStatus::BREAKPOINT),
    ];
    wait_until(|| queued(&broker, session) == 2);

    // Both are deliverable before either is answered.
    let a = next_event(&broker, session);
    let b = next_event(&broker, session);
    assert_ne!(a.client_id.process, b.client_id.process);

    continue_with(&broker, session, &b, ContinueStatus::Continue);
    continue_with(&broker, session, &a, ContinueStatus::Continue);
    for producer in producers {
        producer.join().unwrap().unwrap();
    }
}

#[test]
fn test_event_handles_belong_to_caller()
{
    let broker = Broker::new();
    let target = running_process(&broker, 2, 1);
    let session = attach_new_session(&broker, &target.process, 0);
    let before = broker.handles().len();

    let events = drain(&broker, session);
    let opened: Vec<_> = events.iter().flat_map(|event| event.info.handles()).collect();
    // process + thread + file, thread, file
    assert_eq!(opened.len(), 5);
    assert_eq!(broker.handles().len(), before + opened.len());

    for handle in opened {
        broker.close_handle(handle).unwrap();
    }
    assert_eq!(broker.handles().len(), before);
}
