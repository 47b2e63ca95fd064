//! Lightweight value handle for a serial port.
//!
//! A [`Port`] represents a specific serial device, identified by its device
//! name (`"COM3"`, `"/dev/ttyUSB0"`, ...). Instances with the same device
//! name obtained from the registry represent the same device. A port
//! existing says nothing about the device being present or usable; actually
//! using the port is done through a controller.

use std::sync::Arc;

use crate::controller::ControllerId;
use crate::device::Device;
use crate::driver::SerialDriver;
use crate::error::Result;
use crate::mediator::AccessMediator;
use crate::registry;

/// A value handle for one serial device.
#[derive(Clone)]
pub struct Port {
    pub(crate) device: Arc<Device>,
}

impl Port {
    /// Look up the port for `device_name` through the process-wide
    /// registry. Succeeds for any non-empty name, present or not.
    pub fn new(device_name: &str) -> Result<Self> {
        registry::port(device_name)
    }

    /// A port over a caller-supplied driver, for exercising controllers
    /// against a mock device.
    ///
    /// The backing device is private to this handle and its clones; it is
    /// not shared through the registry, so two `with_driver` ports with the
    /// same name are distinct devices.
    pub fn with_driver<D>(device_name: &str, driver: D) -> Self
    where
        D: SerialDriver + Clone + 'static,
    {
        Self {
            device: Device::with_factory(
                device_name,
                Box::new(move || Box::new(driver.clone())),
            ),
        }
    }

    pub(crate) fn from_device(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// The device name this port represents.
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// A human-readable description of the device. May be empty until the
    /// port has been seen by [`registry::available_ports`].
    pub fn description(&self) -> String {
        self.device.description()
    }

    /// The hardware id of the device. May be empty until the port has been
    /// seen by [`registry::available_ports`].
    pub fn hardware_id(&self) -> String {
        self.device.hardware_id()
    }

    /// Instantaneous read of the controller currently owning the access
    /// list, if any. The answer may be stale as soon as it is read.
    pub fn current_controller_id(&self) -> Option<ControllerId> {
        self.device.current_controller_id()
    }

    pub(crate) fn mediator(&self) -> Arc<AccessMediator> {
        self.device.mediator()
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.device.name() == other.device.name()
    }
}

impl Eq for Port {}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("device_name", &self.device.name())
            .finish()
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.device.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;

    #[test]
    fn test_empty_device_name_is_rejected() {
        assert!(Port::new("").is_err());
    }

    #[test]
    fn test_ports_compare_by_device_name() {
        let a = Port::with_driver("MOCK-EQ", MockDriver::new("MOCK-EQ"));
        let b = Port::with_driver("MOCK-EQ", MockDriver::new("MOCK-EQ"));
        let c = Port::with_driver("MOCK-OTHER", MockDriver::new("MOCK-OTHER"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_clones_share_the_device() {
        let a = Port::with_driver("MOCK-CLONE", MockDriver::new("MOCK-CLONE"));
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.device, &b.device));
    }

    #[test]
    fn test_mock_ports_with_same_name_are_distinct_devices() {
        let a = Port::with_driver("MOCK-TWIN", MockDriver::new("MOCK-TWIN"));
        let b = Port::with_driver("MOCK-TWIN", MockDriver::new("MOCK-TWIN"));
        assert!(!Arc::ptr_eq(&a.device, &b.device));
    }
}
