//! Thin facade over the boxed driver, owning the serialize-mutex policy.
//!
//! Driver operations fall into two groups. Settings access, open/close,
//! buffer queries and control-line operations are short and are serialized
//! with a dedicated mutex. The read/write/wait/flush families are not
//! serialized: a blocking read must leave the device reachable so a setter
//! on another thread can reconfigure the port and abort it.
//!
//! The serialize mutex is never held while waiting on a condition.

use std::time::Duration;

use parking_lot::Mutex;

use super::error::DriverResult;
use super::traits::{DataBits, FlowControl, Parity, SerialDriver, SerialSettings, StopBits};

/// Per-device driver wrapper used by the access mediator.
#[derive(Debug)]
pub(crate) struct DriverFacade {
    driver: Box<dyn SerialDriver>,
    serialize: Mutex<()>,
}

impl DriverFacade {
    pub(crate) fn new(driver: Box<dyn SerialDriver>) -> Self {
        Self {
            driver,
            serialize: Mutex::new(()),
        }
    }

    // Opening and closing (serialized).

    pub(crate) fn open(&self) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        self.driver.open()
    }

    pub(crate) fn ensure_open(&self) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        if !self.driver.is_open() {
            self.driver.open()?;
        }
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        let _serialize = self.serialize.lock();
        self.driver.is_open()
    }

    pub(crate) fn close(&self) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        self.driver.close()
    }

    pub(crate) fn available(&self) -> DriverResult<usize> {
        let _serialize = self.serialize.lock();
        self.driver.available()
    }

    // Reading, writing and waiting (not serialized).

    pub(crate) fn wait_readable(&self) -> DriverResult<bool> {
        self.driver.wait_readable()
    }

    pub(crate) fn wait_byte_times(&self, count: usize) -> DriverResult<()> {
        self.driver.wait_byte_times(count)
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> DriverResult<usize> {
        self.driver.read(buf)
    }

    /// Read exactly `size` bytes into a fresh buffer, truncated to what
    /// arrived before the timeout.
    pub(crate) fn read_bytes(&self, size: usize) -> DriverResult<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let n = self.driver.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read one byte at a time until `eol` is seen, `max` bytes have been
    /// collected, or a read times out.
    pub(crate) fn readline(&self, max: usize, eol: &str) -> DriverResult<String> {
        let line = self.readline_bytes(max, eol)?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn readline_bytes(&self, max: usize, eol: &str) -> DriverResult<Vec<u8>> {
        let eol = eol.as_bytes();
        let mut line: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        while line.len() < max {
            let n = self.driver.read(&mut byte)?;
            if n == 0 {
                break;
            }
            line.push(byte[0]);
            if !eol.is_empty() && line.ends_with(eol) {
                break;
            }
        }
        Ok(line)
    }

    /// Read lines until the device stops producing data within a timeout,
    /// collecting at most `max` raw bytes in total.
    pub(crate) fn readlines(&self, max: usize, eol: &str) -> DriverResult<Vec<String>> {
        let mut lines = Vec::new();
        let mut remaining = max;
        while remaining > 0 {
            // The budget counts bytes read off the wire, not decoded
            // characters: lossy decoding widens invalid bytes.
            let line = self.readline_bytes(remaining, eol)?;
            if line.is_empty() {
                break;
            }
            remaining -= line.len();
            let terminated = line.ends_with(eol.as_bytes());
            lines.push(String::from_utf8_lossy(&line).into_owned());
            if !terminated {
                // A short line means the read timed out mid-line.
                break;
            }
        }
        Ok(lines)
    }

    pub(crate) fn write(&self, data: &[u8]) -> DriverResult<usize> {
        self.driver.write(data)
    }

    pub(crate) fn flush(&self) -> DriverResult<()> {
        self.driver.flush()
    }

    pub(crate) fn flush_input(&self) -> DriverResult<()> {
        self.driver.flush_input()
    }

    pub(crate) fn flush_output(&self) -> DriverResult<()> {
        self.driver.flush_output()
    }

    // Settings (serialized). Each setter honours `only_if_different` to
    // avoid redundant port reconfiguration.

    pub(crate) fn settings(&self) -> SerialSettings {
        let _serialize = self.serialize.lock();
        self.driver.settings()
    }

    pub(crate) fn set_baud_rate(&self, baud_rate: u32, only_if_different: bool) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        if !only_if_different || self.driver.settings().baud_rate != baud_rate {
            self.driver.set_baud_rate(baud_rate)?;
        }
        Ok(())
    }

    pub(crate) fn set_timeout(&self, timeout: Duration, only_if_different: bool) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        if !only_if_different || self.driver.settings().timeout != timeout {
            self.driver.set_timeout(timeout)?;
        }
        Ok(())
    }

    pub(crate) fn set_data_bits(
        &self,
        data_bits: DataBits,
        only_if_different: bool,
    ) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        if !only_if_different || self.driver.settings().data_bits != data_bits {
            self.driver.set_data_bits(data_bits)?;
        }
        Ok(())
    }

    pub(crate) fn set_parity(&self, parity: Parity, only_if_different: bool) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        if !only_if_different || self.driver.settings().parity != parity {
            self.driver.set_parity(parity)?;
        }
        Ok(())
    }

    pub(crate) fn set_stop_bits(
        &self,
        stop_bits: StopBits,
        only_if_different: bool,
    ) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        if !only_if_different || self.driver.settings().stop_bits != stop_bits {
            self.driver.set_stop_bits(stop_bits)?;
        }
        Ok(())
    }

    pub(crate) fn set_flow_control(
        &self,
        flow_control: FlowControl,
        only_if_different: bool,
    ) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        if !only_if_different || self.driver.settings().flow_control != flow_control {
            self.driver.set_flow_control(flow_control)?;
        }
        Ok(())
    }

    /// Apply a full settings block in field order, stopping at the first
    /// failure.
    pub(crate) fn set_settings(
        &self,
        settings: &SerialSettings,
        only_if_different: bool,
    ) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        let current = self.driver.settings();
        if !only_if_different || current.baud_rate != settings.baud_rate {
            self.driver.set_baud_rate(settings.baud_rate)?;
        }
        if !only_if_different || current.timeout != settings.timeout {
            self.driver.set_timeout(settings.timeout)?;
        }
        if !only_if_different || current.data_bits != settings.data_bits {
            self.driver.set_data_bits(settings.data_bits)?;
        }
        if !only_if_different || current.parity != settings.parity {
            self.driver.set_parity(settings.parity)?;
        }
        if !only_if_different || current.stop_bits != settings.stop_bits {
            self.driver.set_stop_bits(settings.stop_bits)?;
        }
        if !only_if_different || current.flow_control != settings.flow_control {
            self.driver.set_flow_control(settings.flow_control)?;
        }
        Ok(())
    }

    // Break and control lines (serialized, except the blocking wait).

    pub(crate) fn send_break(&self, duration: Duration) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        self.driver.send_break(duration)
    }

    pub(crate) fn set_break(&self, level: bool) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        self.driver.set_break(level)
    }

    pub(crate) fn set_rts(&self, level: bool) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        self.driver.set_rts(level)
    }

    pub(crate) fn set_dtr(&self, level: bool) -> DriverResult<()> {
        let _serialize = self.serialize.lock();
        self.driver.set_dtr(level)
    }

    pub(crate) fn wait_for_change(&self) -> DriverResult<bool> {
        self.driver.wait_for_change()
    }

    pub(crate) fn read_cts(&self) -> DriverResult<bool> {
        let _serialize = self.serialize.lock();
        self.driver.read_cts()
    }

    pub(crate) fn read_dsr(&self) -> DriverResult<bool> {
        let _serialize = self.serialize.lock();
        self.driver.read_dsr()
    }

    pub(crate) fn read_ri(&self) -> DriverResult<bool> {
        let _serialize = self.serialize.lock();
        self.driver.read_ri()
    }

    pub(crate) fn read_cd(&self) -> DriverResult<bool> {
        let _serialize = self.serialize.lock();
        self.driver.read_cd()
    }
}
