//! Shared serial-port access arbitration.
//!
//! This library lets multiple independent *controllers* share one physical
//! serial device. A per-device mediator guarantees that at most one
//! controller (the *active* controller) may perform I/O at any instant,
//! while role handovers between controllers are queued, serialized, and
//! cancellable from any thread.
//!
//! # Modules
//!
//! - `controller`: the [`Controller`] trait and [`ControllerCore`], the
//!   contract every arbitration participant implements
//! - `serial`: [`SerialController`], a concrete controller with a
//!   *locked-active* reservation
//! - `port`: [`Port`], the value handle identifying a device
//! - `registry`: port lookup and enumeration
//! - `driver`: the serial backend abstraction, the `serialport`-based
//!   native driver, and a mock driver for tests
//! - `error`: the unified error type
//!
//! # Example
//!
//! ```no_run
//! use shared_serial::SerialController;
//!
//! let logger = SerialController::for_device("/dev/ttyUSB0")?;
//! logger.make_active()?;
//! logger.ensure_open()?;
//! logger.write(b"hello")?;
//!
//! // A second controller takes over; `logger` is asked to step aside and,
//! // being unlocked, lets go once its in-flight calls have drained.
//! let probe = SerialController::for_device("/dev/ttyUSB0")?;
//! probe.make_active()?;
//! assert!(!logger.is_active());
//! # Ok::<(), shared_serial::Error>(())
//! ```

pub mod controller;
pub mod driver;
pub mod error;
pub mod port;
pub mod registry;
pub mod serial;

mod device;
mod mediator;

// Re-export commonly used types for convenience.
pub use controller::{make_active, Controller, ControllerCore, ControllerId, DEFAULT_DRAIN_TIMEOUT};
pub use driver::{
    DataBits, DriverError, FlowControl, MockDriver, NativeDriver, Parity, SerialDriver,
    SerialSettings, StopBits,
};
pub use error::{Error, Result};
pub use port::Port;
pub use registry::{available_ports, PortInfo};
pub use serial::SerialController;
