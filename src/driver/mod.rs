//! Serial driver abstraction layer.
//!
//! Provides the [`SerialDriver`] trait the access mediator consumes, the
//! `serialport`-backed [`NativeDriver`], and a [`MockDriver`] for exercising
//! the arbitration layer without hardware.

pub mod error;
pub mod mock;
pub mod native;
pub mod traits;

pub(crate) mod facade;

pub use error::{DriverError, DriverResult};
pub use mock::MockDriver;
pub use native::NativeDriver;
pub use traits::{DataBits, FlowControl, Parity, SerialDriver, SerialSettings, StopBits};
