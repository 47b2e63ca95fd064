//! Process-wide port registry.
//!
//! The registry maps device names to device objects so that every [`Port`]
//! handle for a name refers to the same device, and with it the same access
//! mediator. Devices are held weakly: once every port and controller for a
//! name is gone, the device is dropped and the entry pruned.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::Device;
use crate::driver::DriverError;
use crate::error::{Error, Result};
use crate::port::Port;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);

#[derive(Default)]
struct Registry {
    devices: Mutex<HashMap<String, Weak<Device>>>,
}

impl Registry {
    fn device(&self, device_name: &str) -> Arc<Device> {
        let mut devices = self.devices.lock();
        devices.retain(|_, weak| weak.strong_count() > 0);
        if let Some(device) = devices.get(device_name).and_then(Weak::upgrade) {
            return device;
        }
        debug!(device = device_name, "registering device");
        let device = Device::with_native_driver(device_name);
        devices.insert(device_name.to_string(), Arc::downgrade(&device));
        device
    }
}

/// Description of an enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// The device name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// Human-readable description; empty when the platform offers none.
    pub description: String,
    /// Hardware id string; empty when the platform offers none.
    pub hardware_id: String,
}

impl PortInfo {
    /// The registry port for this device.
    pub fn port(&self) -> Result<Port> {
        port(&self.name)
    }
}

/// Return the port for the given device name.
///
/// Succeeds for any non-empty `device_name`, even for devices that are
/// invalid or absent.
pub fn port(device_name: &str) -> Result<Port> {
    if device_name.is_empty() {
        return Err(Error::invalid("device name must not be empty"));
    }
    Ok(Port::from_device(REGISTRY.device(device_name)))
}

/// Enumerate the serial ports currently present on the system, refreshing
/// the cached description and hardware id of each known device.
pub fn available_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(DriverError::Serial)?;
    let mut infos = Vec::with_capacity(ports.len());
    for info in ports {
        let (description, hardware_id) = details_for(&info.port_type);
        let device = REGISTRY.device(&info.port_name);
        device.set_details(description.clone(), hardware_id.clone());
        infos.push(PortInfo {
            name: info.port_name,
            description,
            hardware_id,
        });
    }
    Ok(infos)
}

fn details_for(port_type: &serialport::SerialPortType) -> (String, String) {
    match port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            let description = usb
                .product
                .clone()
                .or_else(|| usb.manufacturer.clone())
                .unwrap_or_default();
            let mut hardware_id = format!("USB VID:PID={:04x}:{:04x}", usb.vid, usb.pid);
            if let Some(serial) = &usb.serial_number {
                hardware_id.push_str(" SER=");
                hardware_id.push_str(serial);
            }
            (description, hardware_id)
        }
        serialport::SerialPortType::PciPort => (String::new(), "PCI".to_string()),
        serialport::SerialPortType::BluetoothPort => (String::new(), "Bluetooth".to_string()),
        serialport::SerialPortType::Unknown => (String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(matches!(port(""), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_same_name_yields_the_same_device() {
        let a = port("/dev/ttyTEST-REG").unwrap();
        let b = port("/dev/ttyTEST-REG").unwrap();
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.device, &b.device));
    }

    #[test]
    fn test_dead_entries_are_pruned() {
        {
            let _short_lived = port("/dev/ttyTEST-PRUNE").unwrap();
        }
        // A later lookup builds a fresh device rather than resurrecting the
        // dropped one.
        let revived = port("/dev/ttyTEST-PRUNE").unwrap();
        assert_eq!(revived.device_name(), "/dev/ttyTEST-PRUNE");
    }

    #[test]
    fn test_usb_details_format() {
        let usb = serialport::SerialPortType::UsbPort(serialport::UsbPortInfo {
            vid: 0x0403,
            pid: 0x6001,
            serial_number: Some("A1B2C3".to_string()),
            manufacturer: Some("FTDI".to_string()),
            product: Some("FT232R USB UART".to_string()),
        });
        let (description, hardware_id) = details_for(&usb);
        assert_eq!(description, "FT232R USB UART");
        assert_eq!(hardware_id, "USB VID:PID=0403:6001 SER=A1B2C3");
    }
}
