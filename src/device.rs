//! Per-name device object.
//!
//! A `Device` uniquely represents one serial device inside the process.
//! Ports are value handles over it, and the mediator that arbitrates the
//! device is created lazily and held only weakly here: controllers share
//! ownership of the mediator, so once the last controller goes away the
//! mediator is dropped and the device is idle again.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::controller::ControllerId;
use crate::driver::{NativeDriver, SerialDriver};
use crate::mediator::AccessMediator;

type DriverFactory = Box<dyn Fn() -> Box<dyn SerialDriver> + Send + Sync>;

#[derive(Default)]
struct DeviceDetails {
    description: String,
    hardware_id: String,
}

pub(crate) struct Device {
    name: String,
    details: Mutex<DeviceDetails>,
    mediator_slot: Mutex<Weak<AccessMediator>>,
    driver_factory: DriverFactory,
}

impl Device {
    /// Create a device whose mediator will drive the real serial backend.
    pub(crate) fn with_native_driver(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let driver_name = name.clone();
        Self::with_factory(
            name,
            Box::new(move || Box::new(NativeDriver::new(driver_name.clone()))),
        )
    }

    /// Create a device with a custom driver factory. Used for mock-backed
    /// ports; such a device is private to its creator and is not shared
    /// through the registry.
    pub(crate) fn with_factory(name: impl Into<String>, driver_factory: DriverFactory) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            details: Mutex::new(DeviceDetails::default()),
            mediator_slot: Mutex::new(Weak::new()),
            driver_factory,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// The device's mediator, created on first use and whenever all
    /// previous controllers have gone away.
    pub(crate) fn mediator(&self) -> Arc<AccessMediator> {
        let mut slot = self.mediator_slot.lock();
        if let Some(mediator) = slot.upgrade() {
            return mediator;
        }
        debug!(device = %self.name, "creating access mediator");
        let mediator = Arc::new(AccessMediator::new(
            self.name.clone(),
            (self.driver_factory)(),
        ));
        *slot = Arc::downgrade(&mediator);
        mediator
    }

    /// Instantaneous read of the current controller, if the device has a
    /// live mediator at all.
    pub(crate) fn current_controller_id(&self) -> Option<ControllerId> {
        self.mediator_slot
            .lock()
            .upgrade()
            .and_then(|mediator| mediator.current_controller_id())
    }

    pub(crate) fn description(&self) -> String {
        self.details.lock().description.clone()
    }

    pub(crate) fn hardware_id(&self) -> String {
        self.details.lock().hardware_id.clone()
    }

    /// Refresh the cached port details, typically from enumeration.
    pub(crate) fn set_details(&self, description: String, hardware_id: String) {
        let mut details = self.details.lock();
        details.description = description;
        details.hardware_id = hardware_id;
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("name", &self.name).finish()
    }
}
