//! Handoff and ordering behavior of the access mediator.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use common::{mock_port, EventLog, ScriptedController};
use shared_serial::{make_active, Controller, Error, SerialController};

#[test]
fn basic_handoff_between_two_controllers() {
    let (mock, port) = mock_port("/dev/xx");
    let a = SerialController::new(&port).unwrap();
    let b = SerialController::new(&port).unwrap();

    a.make_active().unwrap();
    assert!(a.is_active());

    b.make_active().unwrap();
    assert!(b.is_active());
    assert!(!a.is_active());

    // The evicted controller is shut out of I/O entirely.
    let err = a.read_bytes(1).unwrap_err();
    assert!(matches!(err, Error::NotActiveController { .. }));

    // The new active controller gets driver bytes.
    b.ensure_open().unwrap();
    mock.enqueue_read(b"z");
    assert_eq!(b.read_bytes(1).unwrap(), b"z");
}

#[test]
fn driver_errors_propagate_unchanged() {
    let (_mock, port) = mock_port("MOCK-ERR");
    let a = SerialController::new(&port).unwrap();
    a.make_active().unwrap();

    // Reading a closed port surfaces the driver's own error.
    let err = a.read_bytes(1).unwrap_err();
    assert!(matches!(
        err,
        Error::Driver(shared_serial::DriverError::NotOpen)
    ));
}

#[test]
fn settings_flow_through_the_active_controller() {
    let (mock, port) = mock_port("MOCK-SET");
    let a = SerialController::new(&port).unwrap();
    a.make_active().unwrap();

    a.set_baud_rate(115200, false).unwrap();
    assert_eq!(a.baud_rate().unwrap(), 115200);

    // A redundant reconfiguration is skipped when asked to be.
    let before = mock.reconfigure_count();
    a.set_baud_rate(115200, true).unwrap();
    assert_eq!(mock.reconfigure_count(), before);
}

#[test]
fn handoff_fires_the_expected_callbacks() {
    let events = EventLog::new();
    let (_mock, port) = mock_port("MOCK-SEQ");
    let a = ScriptedController::new(&port, "a", &events);
    let b = ScriptedController::new(&port, "b", &events);

    make_active(a.clone()).unwrap();
    assert_eq!(
        events.snapshot(),
        vec!["will_make_active:a", "did_add:a", "did_make_active:a"]
    );

    events.clear();
    make_active(b.clone()).unwrap();
    assert_eq!(
        events.snapshot(),
        vec![
            "will_remove:a",
            "will_make_inactive:a",
            "will_make_active:b",
            "did_make_inactive:a",
            "did_remove:a",
            "did_add:b",
            "did_make_active:b",
        ]
    );
}

#[test]
fn refused_inactivation_leaves_state_untouched() {
    let events = EventLog::new();
    let (_mock, port) = mock_port("MOCK-REFUSE");
    let a = ScriptedController::new(&port, "a", &events);
    let b = ScriptedController::new(&port, "b", &events);

    make_active(a.clone()).unwrap();
    a.refuse_inactive.store(true, std::sync::atomic::Ordering::SeqCst);

    events.clear();
    let err = make_active(b.clone()).unwrap_err();
    assert_eq!(err.refusing_controller(), Some(a.core().id()));
    assert!(a.core().is_active());
    assert!(!b.core().is_active());
    assert_eq!(port.current_controller_id(), Some(a.core().id()));

    // will_remove had accepted, so the cancellation must be delivered.
    assert_eq!(
        events.snapshot(),
        vec![
            "will_remove:a",
            "will_make_inactive:a",
            "did_cancel_remove:a",
        ]
    );
}

#[test]
fn concurrent_activations_commit_in_ticket_order() {
    const CONTROLLERS: usize = 6;

    let events = EventLog::new();
    let (_mock, port) = mock_port("MOCK-FIFO");
    let controllers: Vec<Arc<ScriptedController>> = (0..CONTROLLERS)
        .map(|i| ScriptedController::new(&port, &format!("c{i}"), &events))
        .collect();

    let barrier = Arc::new(Barrier::new(CONTROLLERS));
    let handles: Vec<_> = controllers
        .iter()
        .cloned()
        .map(|controller| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                make_active(controller)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    // Every controller became active exactly once, with no overlap: the
    // activation log is a serialized sequence of distinct controllers.
    let activations = events.of_kind("did_make_active");
    assert_eq!(activations.len(), CONTROLLERS);
    let distinct: HashSet<_> = activations.iter().collect();
    assert_eq!(distinct.len(), CONTROLLERS);

    // The last committed activation is the controller left active.
    let last = activations.last().unwrap().clone();
    let winner = controllers
        .iter()
        .find(|c| format!("did_make_active:{}", c.name()) == last)
        .unwrap();
    assert!(winner.core().is_active());
    assert_eq!(port.current_controller_id(), Some(winner.core().id()));

    // Everyone else has been retired.
    for controller in &controllers {
        if controller.core().id() != winner.core().id() {
            assert!(!controller.core().is_active());
        }
    }
}
