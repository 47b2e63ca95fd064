//! Native serial driver backed by the `serialport` crate.
//!
//! The device is opened lazily: a `NativeDriver` is created closed, settings
//! are staged in memory, and everything is applied when `open` runs. This
//! keeps the port untouched until a controller explicitly opens it.
//!
//! The native backend serializes operations on the device handle with an
//! internal mutex, so a concurrent settings call waits for an in-flight read
//! to finish. The timeout-bounded read loop keeps that window short.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::error::{DriverError, DriverResult};
use super::traits::{DataBits, FlowControl, Parity, SerialDriver, SerialSettings, StopBits};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct NativeState {
    port: Option<Box<dyn serialport::SerialPort>>,
    settings: SerialSettings,
}

/// Serial driver over a real device node such as `/dev/ttyUSB0` or `COM3`.
pub struct NativeDriver {
    name: String,
    inner: Mutex<NativeState>,
}

impl NativeDriver {
    /// Create a closed driver for the given device name. The name is not
    /// validated here; a missing device surfaces as `NotFound` on open.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(NativeState {
                port: None,
                settings: SerialSettings::default(),
            }),
        }
    }

    /// The device name this driver targets.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SerialDriver for NativeDriver {
    fn open(&self) -> DriverResult<()> {
        let mut state = self.inner.lock();
        if state.port.is_some() {
            return Err(DriverError::AlreadyOpen);
        }
        let settings = state.settings.clone();
        let port = serialport::new(&self.name, settings.baud_rate)
            .data_bits(settings.data_bits.into())
            .flow_control(settings.flow_control.into())
            .parity(settings.parity.into())
            .stop_bits(settings.stop_bits.into())
            .timeout(settings.timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => DriverError::not_found(&self.name),
                serialport::ErrorKind::InvalidInput => DriverError::config(e.to_string()),
                _ => DriverError::Serial(e),
            })?;
        state.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().port.is_some()
    }

    fn close(&self) -> DriverResult<()> {
        self.inner.lock().port = None;
        Ok(())
    }

    fn available(&self) -> DriverResult<usize> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.bytes_to_read()? as usize)
    }

    fn wait_readable(&self) -> DriverResult<bool> {
        let deadline = Instant::now() + self.settings().timeout;
        loop {
            {
                let mut state = self.inner.lock();
                let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
                if port.bytes_to_read()? > 0 {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn wait_byte_times(&self, count: usize) -> DriverResult<()> {
        let byte_time = self.settings().byte_time();
        std::thread::sleep(byte_time * count as u32);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> DriverResult<usize> {
        let mut state = self.inner.lock();
        let timeout = state.settings.timeout;
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        let deadline = Instant::now() + timeout;
        let mut total = 0;
        while total < buf.len() {
            match port.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                // The handle's own timeout lapsed with nothing new; a short
                // count is the contract, not an error.
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DriverError::Io(e)),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(total)
    }

    fn write(&self, data: &[u8]) -> DriverResult<usize> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.write(data)?)
    }

    fn settings(&self) -> SerialSettings {
        self.inner.lock().settings.clone()
    }

    fn set_timeout(&self, timeout: Duration) -> DriverResult<()> {
        let mut state = self.inner.lock();
        if let Some(port) = state.port.as_mut() {
            port.set_timeout(timeout)?;
        }
        state.settings.timeout = timeout;
        Ok(())
    }

    fn set_baud_rate(&self, baud_rate: u32) -> DriverResult<()> {
        let mut state = self.inner.lock();
        if let Some(port) = state.port.as_mut() {
            port.set_baud_rate(baud_rate)?;
        }
        state.settings.baud_rate = baud_rate;
        Ok(())
    }

    fn set_data_bits(&self, data_bits: DataBits) -> DriverResult<()> {
        let mut state = self.inner.lock();
        if let Some(port) = state.port.as_mut() {
            port.set_data_bits(data_bits.into())?;
        }
        state.settings.data_bits = data_bits;
        Ok(())
    }

    fn set_parity(&self, parity: Parity) -> DriverResult<()> {
        let mut state = self.inner.lock();
        if let Some(port) = state.port.as_mut() {
            port.set_parity(parity.into())?;
        }
        state.settings.parity = parity;
        Ok(())
    }

    fn set_stop_bits(&self, stop_bits: StopBits) -> DriverResult<()> {
        let mut state = self.inner.lock();
        if let Some(port) = state.port.as_mut() {
            port.set_stop_bits(stop_bits.into())?;
        }
        state.settings.stop_bits = stop_bits;
        Ok(())
    }

    fn set_flow_control(&self, flow_control: FlowControl) -> DriverResult<()> {
        let mut state = self.inner.lock();
        if let Some(port) = state.port.as_mut() {
            port.set_flow_control(flow_control.into())?;
        }
        state.settings.flow_control = flow_control;
        Ok(())
    }

    fn flush(&self) -> DriverResult<()> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.flush()?)
    }

    fn flush_input(&self) -> DriverResult<()> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.clear(serialport::ClearBuffer::Input)?)
    }

    fn flush_output(&self) -> DriverResult<()> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.clear(serialport::ClearBuffer::Output)?)
    }

    fn send_break(&self, duration: Duration) -> DriverResult<()> {
        self.set_break(true)?;
        std::thread::sleep(duration);
        self.set_break(false)
    }

    fn set_break(&self, level: bool) -> DriverResult<()> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        if level {
            Ok(port.set_break()?)
        } else {
            Ok(port.clear_break()?)
        }
    }

    fn set_rts(&self, level: bool) -> DriverResult<()> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.write_request_to_send(level)?)
    }

    fn set_dtr(&self, level: bool) -> DriverResult<()> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.write_data_terminal_ready(level)?)
    }

    fn wait_for_change(&self) -> DriverResult<bool> {
        // `serialport` has no native line-change wait; poll the four input
        // lines until one flips or the configured timeout lapses.
        let deadline = Instant::now() + self.settings().timeout;
        let snapshot = {
            let mut state = self.inner.lock();
            let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
            read_lines(port.as_mut())?
        };
        loop {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
            let mut state = self.inner.lock();
            let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
            if read_lines(port.as_mut())? != snapshot {
                return Ok(true);
            }
        }
    }

    fn read_cts(&self) -> DriverResult<bool> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.read_clear_to_send()?)
    }

    fn read_dsr(&self) -> DriverResult<bool> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.read_data_set_ready()?)
    }

    fn read_ri(&self) -> DriverResult<bool> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.read_ring_indicator()?)
    }

    fn read_cd(&self) -> DriverResult<bool> {
        let mut state = self.inner.lock();
        let port = state.port.as_mut().ok_or(DriverError::NotOpen)?;
        Ok(port.read_carrier_detect()?)
    }
}

fn read_lines(port: &mut dyn serialport::SerialPort) -> DriverResult<(bool, bool, bool, bool)> {
    Ok((
        port.read_clear_to_send()?,
        port.read_data_set_ready()?,
        port.read_ring_indicator()?,
        port.read_carrier_detect()?,
    ))
}

impl std::fmt::Debug for NativeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("NativeDriver")
            .field("name", &self.name)
            .field("open", &state.port.is_some())
            .field("settings", &state.settings)
            .finish()
    }
}
