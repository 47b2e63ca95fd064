//! Shared test infrastructure for the arbitration tests.
//!
//! Provides a mock-backed port builder, an event log shared between
//! controllers, and `ScriptedController`, a minimal controller whose
//! callbacks record themselves and can be told to refuse transitions.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use shared_serial::driver::MockDriver;
use shared_serial::{
    Controller, ControllerCore, Error, Port, Result, DEFAULT_DRAIN_TIMEOUT,
};

/// Create a mock driver and a private port over it.
pub fn mock_port(name: &str) -> (MockDriver, Port) {
    let mock = MockDriver::new(name);
    (mock.clone(), Port::with_driver(name, mock))
}

/// Install a test subscriber once, honouring `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A shared, append-only record of callback invocations.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: &str, name: &str) {
        self.events.lock().unwrap().push(format!("{kind}:{name}"));
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// All recorded events of one kind, in order.
    pub fn of_kind(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{kind}:");
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

/// A controller whose callbacks record themselves into an [`EventLog`] and
/// can be scripted to refuse removal or inactivation.
pub struct ScriptedController {
    name: String,
    core: ControllerCore,
    events: EventLog,
    pub refuse_remove: AtomicBool,
    pub refuse_inactive: AtomicBool,
}

impl ScriptedController {
    pub fn new(port: &Port, name: &str, events: &EventLog) -> Arc<Self> {
        Self::with_delegates(port, name, events, Vec::new())
    }

    pub fn with_delegates(
        port: &Port,
        name: &str,
        events: &EventLog,
        delegates: Vec<Arc<dyn Controller>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            core: ControllerCore::new(port, name, delegates).unwrap(),
            events: events.clone(),
            refuse_remove: AtomicBool::new(false),
            refuse_inactive: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Controller for ScriptedController {
    fn core(&self) -> &ControllerCore {
        &self.core
    }

    fn will_remove(&self) -> Result<()> {
        self.events.record("will_remove", &self.name);
        if self.refuse_remove.load(Ordering::SeqCst) {
            return Err(Error::refused(
                self.core.id(),
                self.core.description(),
                "scripted removal refusal",
            ));
        }
        Ok(())
    }

    fn will_make_inactive(&self) -> Result<()> {
        self.events.record("will_make_inactive", &self.name);
        if self.refuse_inactive.load(Ordering::SeqCst) {
            return Err(Error::refused(
                self.core.id(),
                self.core.description(),
                "scripted inactivation refusal",
            ));
        }
        self.core.block_access_calls()?;
        if !self
            .core
            .wait_for_all_access_calls_to_return(DEFAULT_DRAIN_TIMEOUT)?
        {
            return Err(Error::refused(
                self.core.id(),
                self.core.description(),
                "access calls have not returned",
            ));
        }
        Ok(())
    }

    fn will_make_active(&self) {
        self.events.record("will_make_active", &self.name);
    }

    fn did_make_active(&self) -> Result<()> {
        self.events.record("did_make_active", &self.name);
        Ok(())
    }

    fn did_make_inactive(&self) {
        self.events.record("did_make_inactive", &self.name);
    }

    fn did_cancel_make_inactive(&self) {
        self.events.record("did_cancel_make_inactive", &self.name);
    }

    fn did_add(&self) {
        self.events.record("did_add", &self.name);
    }

    fn did_remove(&self) {
        self.events.record("did_remove", &self.name);
    }

    fn did_cancel_remove(&self) {
        self.events.record("did_cancel_remove", &self.name);
    }
}
