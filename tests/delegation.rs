//! Delegation: subtree access lists, refusals, and nested active changes.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};

use common::{mock_port, EventLog, ScriptedController};
use shared_serial::{make_active, Controller, ControllerCore, Port, Result};

#[test]
fn delegate_activation_keeps_the_current_controller() {
    let events = EventLog::new();
    let (_mock, port) = mock_port("MOCK-DELEGATE");
    let d = ScriptedController::new(&port, "d", &events);
    let c = ScriptedController::with_delegates(
        &port,
        "c",
        &events,
        vec![d.clone() as Arc<dyn Controller>],
    );

    make_active(c.clone()).unwrap();
    // The whole subtree is added, deepest delegates first.
    assert_eq!(
        events.snapshot(),
        vec!["will_make_active:c", "did_add:d", "did_add:c", "did_make_active:c"]
    );

    events.clear();
    make_active(d.clone()).unwrap();
    assert!(d.core().is_active());
    assert_eq!(port.current_controller_id(), Some(c.core().id()));

    // An in-list activation is a pure active-controller change: nobody is
    // asked about removal.
    assert_eq!(
        events.snapshot(),
        vec![
            "will_make_inactive:c",
            "will_make_active:d",
            "did_make_inactive:c",
            "did_make_active:d",
        ]
    );
}

#[test]
fn a_refusing_delegate_aborts_the_whole_change() {
    let events = EventLog::new();
    let (_mock, port) = mock_port("MOCK-VETO");
    let d = ScriptedController::new(&port, "d", &events);
    let c = ScriptedController::with_delegates(
        &port,
        "c",
        &events,
        vec![d.clone() as Arc<dyn Controller>],
    );
    let e = ScriptedController::new(&port, "e", &events);

    make_active(c.clone()).unwrap();
    make_active(d.clone()).unwrap();

    d.refuse_remove.store(true, Ordering::SeqCst);
    events.clear();
    let err = make_active(e.clone()).unwrap_err();
    assert_eq!(err.refusing_controller(), Some(d.core().id()));

    // Still exactly where we were: C current, D active.
    assert_eq!(port.current_controller_id(), Some(c.core().id()));
    assert!(d.core().is_active());
    assert!(!e.core().is_active());

    // Only controllers whose will_remove had accepted hear the cancel.
    assert_eq!(
        events.snapshot(),
        vec!["will_remove:c", "will_remove:d", "did_cancel_remove:c"]
    );

    // Once the veto is lifted the eviction completes, root first out,
    // deepest delegate first in.
    d.refuse_remove.store(false, Ordering::SeqCst);
    events.clear();
    make_active(e.clone()).unwrap();
    assert_eq!(
        events.snapshot(),
        vec![
            "will_remove:c",
            "will_remove:d",
            "will_make_inactive:d",
            "will_make_active:e",
            "did_make_inactive:d",
            "did_remove:c",
            "did_remove:d",
            "did_add:e",
            "did_make_active:e",
        ]
    );
    assert_eq!(port.current_controller_id(), Some(e.core().id()));
}

/// A delegating controller that, when asked to leave the access list,
/// first pulls the active role back to itself through a nested
/// active-controller change.
struct ReclaimOnRemove {
    core: ControllerCore,
    this: Mutex<Weak<dyn Controller>>,
}

impl ReclaimOnRemove {
    fn with_delegates(port: &Port, delegates: Vec<Arc<dyn Controller>>) -> Arc<Self> {
        let empty: Weak<dyn Controller> = Weak::<Self>::new();
        let controller = Arc::new(Self {
            core: ControllerCore::new(port, "reclaimer", delegates).unwrap(),
            this: Mutex::new(empty),
        });
        let as_dyn: Arc<dyn Controller> = controller.clone();
        *controller.this.lock().unwrap() = Arc::downgrade(&as_dyn);
        controller
    }
}

impl Controller for ReclaimOnRemove {
    fn core(&self) -> &ControllerCore {
        &self.core
    }

    fn will_remove(&self) -> Result<()> {
        // Legal here and only here: an active-controller change nested in
        // the current-controller change that is evicting us.
        let this = self.this.lock().unwrap().upgrade();
        if let Some(this) = this {
            if !this.core().is_active() {
                make_active(this)?;
            }
        }
        Ok(())
    }
}

#[test]
fn nested_active_change_from_will_remove() {
    let events = EventLog::new();
    let (_mock, port) = mock_port("MOCK-NESTED");
    let d = ScriptedController::new(&port, "d", &events);
    let c = ReclaimOnRemove::with_delegates(&port, vec![d.clone() as Arc<dyn Controller>]);
    let e = ScriptedController::new(&port, "e", &events);

    make_active(c.clone()).unwrap();
    make_active(d.clone()).unwrap();
    assert!(d.core().is_active());

    // Evicting the subtree triggers C's reclaim: D is retired through a
    // nested change before the eviction proceeds, then E takes over.
    events.clear();
    make_active(e.clone()).unwrap();
    assert!(e.core().is_active());
    assert!(!d.core().is_active());
    assert_eq!(port.current_controller_id(), Some(e.core().id()));

    // D was retired by the nested change (inside will_remove), before its
    // own will_remove ran.
    let snapshot = events.snapshot();
    let retired_at = snapshot
        .iter()
        .position(|e| e == "did_make_inactive:d")
        .expect("nested change retired d");
    let asked_at = snapshot
        .iter()
        .position(|e| e == "will_remove:d")
        .expect("d was asked about removal");
    assert!(retired_at < asked_at, "events: {snapshot:?}");
}
