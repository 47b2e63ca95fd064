//! Core trait and value types for the serial driver.
//!
//! The mediator consumes the serial device through [`SerialDriver`], which
//! abstracts over the real `serialport` backend and mock implementations so
//! the arbitration layer can be exercised without hardware.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::DriverResult;

/// Configuration parameters for a serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate (bits per second).
    pub baud_rate: u32,

    /// Number of data bits (5, 6, 7, or 8).
    pub data_bits: DataBits,

    /// Flow control mode.
    pub flow_control: FlowControl,

    /// Parity checking mode.
    pub parity: Parity,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_secs(1),
        }
    }
}

impl SerialSettings {
    /// Nominal transmission time for one character at these settings,
    /// including start, parity and stop bits.
    pub fn byte_time(&self) -> Duration {
        let data_bits = match self.data_bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let parity_bits = match self.parity {
            Parity::None => 0,
            Parity::Odd | Parity::Even => 1,
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        let bits_per_byte = 1 + data_bits + parity_bits + stop_bits;
        let nanos = (bits_per_byte as u64 * 1_000_000_000) / self.baud_rate.max(1) as u64;
        Duration::from_nanos(nanos)
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Flow control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// The set of serial device operations the arbitration core consumes.
///
/// Implementations synchronize internally: blocking reads and writes must
/// not prevent a settings call from another thread from reaching the device
/// (the mediator relies on this to let a setter abort a parked read).
/// Settings may be staged while the port is closed.
pub trait SerialDriver: Send + Sync + std::fmt::Debug {
    /// Open the device. Fails with `AlreadyOpen` if it is open.
    fn open(&self) -> DriverResult<()>;

    /// Whether the device is currently open.
    fn is_open(&self) -> bool;

    /// Close the device. Closing a closed device is a no-op.
    fn close(&self) -> DriverResult<()>;

    /// Number of bytes waiting in the receive buffer.
    fn available(&self) -> DriverResult<usize>;

    /// Block until there is data to read or the read timeout lapses.
    /// Returns `true` if the port is readable.
    fn wait_readable(&self) -> DriverResult<bool>;

    /// Block for the time it would take to transmit `count` bytes at the
    /// current settings.
    fn wait_byte_times(&self, count: usize) -> DriverResult<()>;

    /// Read up to `buf.len()` bytes, blocking until the requested amount has
    /// arrived or the configured timeout lapses. Returns the byte count; a
    /// short or zero count signals a timeout, not an error.
    fn read(&self, buf: &mut [u8]) -> DriverResult<usize>;

    /// Write the buffer to the device, returning the number of bytes
    /// accepted.
    fn write(&self, data: &[u8]) -> DriverResult<usize>;

    /// Current settings as staged or applied.
    fn settings(&self) -> SerialSettings;

    /// Replace the read/write timeout.
    fn set_timeout(&self, timeout: Duration) -> DriverResult<()>;

    /// Replace the baud rate.
    fn set_baud_rate(&self, baud_rate: u32) -> DriverResult<()>;

    /// Replace the data-bits setting.
    fn set_data_bits(&self, data_bits: DataBits) -> DriverResult<()>;

    /// Replace the parity setting.
    fn set_parity(&self, parity: Parity) -> DriverResult<()>;

    /// Replace the stop-bits setting.
    fn set_stop_bits(&self, stop_bits: StopBits) -> DriverResult<()>;

    /// Replace the flow-control setting.
    fn set_flow_control(&self, flow_control: FlowControl) -> DriverResult<()>;

    /// Block until all written data has been transmitted.
    fn flush(&self) -> DriverResult<()>;

    /// Discard the receive buffer.
    fn flush_input(&self) -> DriverResult<()>;

    /// Discard the transmit buffer.
    fn flush_output(&self) -> DriverResult<()>;

    /// Assert the break condition for `duration`.
    fn send_break(&self, duration: Duration) -> DriverResult<()>;

    /// Set or clear the break condition.
    fn set_break(&self, level: bool) -> DriverResult<()>;

    /// Set the RTS (request to send) line level.
    fn set_rts(&self, level: bool) -> DriverResult<()>;

    /// Set the DTR (data terminal ready) line level.
    fn set_dtr(&self, level: bool) -> DriverResult<()>;

    /// Block until one of the input control lines (CTS, DSR, RI, CD)
    /// changes. Returns `true` if a line changed.
    fn wait_for_change(&self) -> DriverResult<bool>;

    /// Current level of the CTS (clear to send) line.
    fn read_cts(&self) -> DriverResult<bool>;

    /// Current level of the DSR (data set ready) line.
    fn read_dsr(&self) -> DriverResult<bool>;

    /// Current level of the RI (ring indicator) line.
    fn read_ri(&self) -> DriverResult<bool>;

    /// Current level of the CD (carrier detect) line.
    fn read_cd(&self) -> DriverResult<bool>;
}
