//! Controller lifecycle: drop semantics and access-list hygiene.

mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};

use common::{mock_port, EventLog, ScriptedController};
use shared_serial::{make_active, Controller, SerialController};

#[test]
fn dropping_the_current_controller_clears_the_access_list() {
    let (_mock, port) = mock_port("MOCK-DROP");
    let a = SerialController::new(&port).unwrap();
    a.make_active().unwrap();
    assert_eq!(port.current_controller_id(), Some(a.id()));

    drop(a);
    assert_eq!(port.current_controller_id(), None);

    // The device is free for the next controller.
    let b = SerialController::new(&port).unwrap();
    b.make_active().unwrap();
    assert!(b.is_active());
}

#[test]
fn dropping_a_locked_controller_still_removes_it() {
    let (_mock, port) = mock_port("MOCK-DROP-LOCK");
    let a = SerialController::new(&port).unwrap();
    a.make_locked_active().unwrap();

    // Removal from the destructor is self-initiated, so the lock does not
    // block it.
    drop(a);
    assert_eq!(port.current_controller_id(), None);
}

#[test]
fn dropping_an_inactive_controller_is_silent() {
    let (_mock, port) = mock_port("MOCK-DROP-IDLE");
    let a = SerialController::new(&port).unwrap();
    let b = SerialController::new(&port).unwrap();
    a.make_active().unwrap();
    b.make_active().unwrap();

    // A is out of the access list already; its drop must not disturb B.
    drop(a);
    assert!(b.is_active());
    assert_eq!(port.current_controller_id(), Some(b.id()));
}

#[test]
fn dropping_a_live_delegate_is_a_logic_error() {
    let events = EventLog::new();
    let (_mock, port) = mock_port("MOCK-DROP-DELEGATE");
    let d = SerialController::new(&port).unwrap();
    let parent = ScriptedController::with_delegates(
        &port,
        "parent",
        &events,
        vec![d.handle()],
    );

    make_active(parent.clone()).unwrap();

    // The delegating controller still references d, so dropping d's owner
    // cannot remove it from the access list.
    let outcome = catch_unwind(AssertUnwindSafe(move || drop(d)));
    assert!(outcome.is_err());

    // The subtree itself is unharmed.
    assert!(parent.core().is_active());
    assert_eq!(port.current_controller_id(), Some(parent.core().id()));
}
