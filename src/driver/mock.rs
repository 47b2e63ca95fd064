//! Mock serial driver for testing.
//!
//! Simulates a serial device without hardware: reads are fed from a scripted
//! queue, writes are logged, and modem lines can be toggled from the test.
//! Unlike a trivial mock, reads genuinely block on a condition variable
//! until the requested bytes arrive or the configured timeout lapses, which
//! lets the arbitration tests park a reader thread for real.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::error::{DriverError, DriverResult};
use super::traits::{DataBits, FlowControl, Parity, SerialDriver, SerialSettings, StopBits};

#[derive(Debug, Default)]
struct ModemLines {
    cts: bool,
    dsr: bool,
    ri: bool,
    cd: bool,
}

#[derive(Debug)]
struct MockState {
    open: bool,
    read_queue: VecDeque<u8>,
    write_log: Vec<Vec<u8>>,
    settings: SerialSettings,
    lines: ModemLines,
    /// Bumped whenever a modem line changes; `wait_for_change` watches it.
    line_generation: u64,
    /// When set, blocking reads and waits return immediately as timed out.
    immediate_timeout: bool,
    /// One-shot: the next read or write fails with a timeout error.
    should_timeout: bool,
    break_level: bool,
    rts: bool,
    dtr: bool,
    reconfigure_count: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            open: false,
            read_queue: VecDeque::new(),
            write_log: Vec::new(),
            settings: SerialSettings::default(),
            lines: ModemLines::default(),
            line_generation: 0,
            immediate_timeout: false,
            should_timeout: false,
            break_level: false,
            rts: false,
            dtr: false,
            reconfigure_count: 0,
        }
    }
}

#[derive(Debug)]
struct MockShared {
    state: Mutex<MockState>,
    data_cond: Condvar,
}

/// Mock serial driver.
///
/// Cloning yields another handle over the same simulated device, so a test
/// can keep a handle for scripting while the mediator owns the boxed driver.
///
/// # Example
/// ```
/// use shared_serial::driver::{MockDriver, SerialDriver};
///
/// let mock = MockDriver::new("MOCK0");
/// mock.open().unwrap();
/// mock.enqueue_read(b"Hello");
///
/// let mut buf = [0u8; 5];
/// let n = mock.read(&mut buf).unwrap();
/// assert_eq!(&buf[..n], b"Hello");
///
/// mock.write(b"Response").unwrap();
/// assert_eq!(mock.write_log(), vec![b"Response".to_vec()]);
/// ```
#[derive(Clone, Debug)]
pub struct MockDriver {
    name: String,
    shared: Arc<MockShared>,
}

impl MockDriver {
    /// Create a new mock driver with the given name. The simulated device
    /// starts closed.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(MockShared {
                state: Mutex::new(MockState::default()),
                data_cond: Condvar::new(),
            }),
        }
    }

    /// The device name this mock identifies as.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append bytes to the read queue and wake any blocked reader.
    pub fn enqueue_read(&self, data: &[u8]) {
        let mut state = self.shared.state.lock();
        state.read_queue.extend(data);
        drop(state);
        self.shared.data_cond.notify_all();
    }

    /// Everything written to the device so far, one entry per write call.
    pub fn write_log(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().write_log.clone()
    }

    /// Clear the write log.
    pub fn clear_write_log(&self) {
        self.shared.state.lock().write_log.clear();
    }

    /// Number of bytes waiting in the read queue.
    pub fn available_bytes(&self) -> usize {
        self.shared.state.lock().read_queue.len()
    }

    /// Make the next read or write fail with a timeout error.
    pub fn set_should_timeout(&self, should_timeout: bool) {
        self.shared.state.lock().should_timeout = should_timeout;
    }

    /// Make blocking reads and waits return immediately instead of waiting
    /// out the configured timeout.
    pub fn set_timeout_now(&self) {
        let mut state = self.shared.state.lock();
        state.immediate_timeout = true;
        drop(state);
        self.shared.data_cond.notify_all();
    }

    /// Set the simulated modem line levels, waking `wait_for_change`.
    pub fn set_modem_lines(&self, cts: bool, dsr: bool, ri: bool, cd: bool) {
        let mut state = self.shared.state.lock();
        state.lines = ModemLines { cts, dsr, ri, cd };
        state.line_generation += 1;
        drop(state);
        self.shared.data_cond.notify_all();
    }

    /// Level last set on the RTS line.
    pub fn rts_level(&self) -> bool {
        self.shared.state.lock().rts
    }

    /// Level last set on the DTR line.
    pub fn dtr_level(&self) -> bool {
        self.shared.state.lock().dtr
    }

    /// Level last set on the break line.
    pub fn break_level(&self) -> bool {
        self.shared.state.lock().break_level
    }

    /// How many times a settings setter actually reconfigured the device.
    pub fn reconfigure_count(&self) -> u32 {
        self.shared.state.lock().reconfigure_count
    }

    fn take_timeout_injection(&self, state: &mut MockState) -> DriverResult<()> {
        if state.should_timeout {
            state.should_timeout = false;
            return Err(DriverError::timeout(state.settings.timeout));
        }
        Ok(())
    }
}

impl SerialDriver for MockDriver {
    fn open(&self) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        if state.open {
            return Err(DriverError::AlreadyOpen);
        }
        state.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    fn close(&self) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        state.open = false;
        drop(state);
        self.shared.data_cond.notify_all();
        Ok(())
    }

    fn available(&self) -> DriverResult<usize> {
        let state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        Ok(state.read_queue.len())
    }

    fn wait_readable(&self) -> DriverResult<bool> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        let deadline = Instant::now() + state.settings.timeout;
        while state.open && !state.immediate_timeout && state.read_queue.is_empty() {
            if self
                .shared
                .data_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        Ok(!state.read_queue.is_empty())
    }

    fn wait_byte_times(&self, count: usize) -> DriverResult<()> {
        let byte_time = self.shared.state.lock().settings.byte_time();
        std::thread::sleep(byte_time * count as u32);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> DriverResult<usize> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        self.take_timeout_injection(&mut state)?;
        let deadline = Instant::now() + state.settings.timeout;
        while state.open && !state.immediate_timeout && state.read_queue.len() < buf.len() {
            if self
                .shared
                .data_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        let n = state.read_queue.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.read_queue.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> DriverResult<usize> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        self.take_timeout_injection(&mut state)?;
        state.write_log.push(data.to_vec());
        Ok(data.len())
    }

    fn settings(&self) -> SerialSettings {
        self.shared.state.lock().settings.clone()
    }

    fn set_timeout(&self, timeout: Duration) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        state.settings.timeout = timeout;
        state.reconfigure_count += 1;
        Ok(())
    }

    fn set_baud_rate(&self, baud_rate: u32) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        state.settings.baud_rate = baud_rate;
        state.reconfigure_count += 1;
        Ok(())
    }

    fn set_data_bits(&self, data_bits: DataBits) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        state.settings.data_bits = data_bits;
        state.reconfigure_count += 1;
        Ok(())
    }

    fn set_parity(&self, parity: Parity) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        state.settings.parity = parity;
        state.reconfigure_count += 1;
        Ok(())
    }

    fn set_stop_bits(&self, stop_bits: StopBits) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        state.settings.stop_bits = stop_bits;
        state.reconfigure_count += 1;
        Ok(())
    }

    fn set_flow_control(&self, flow_control: FlowControl) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        state.settings.flow_control = flow_control;
        state.reconfigure_count += 1;
        Ok(())
    }

    fn flush(&self) -> DriverResult<()> {
        if !self.is_open() {
            return Err(DriverError::NotOpen);
        }
        Ok(())
    }

    fn flush_input(&self) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        state.read_queue.clear();
        Ok(())
    }

    fn flush_output(&self) -> DriverResult<()> {
        if !self.is_open() {
            return Err(DriverError::NotOpen);
        }
        Ok(())
    }

    fn send_break(&self, duration: Duration) -> DriverResult<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.open {
                return Err(DriverError::NotOpen);
            }
            state.break_level = true;
        }
        std::thread::sleep(duration);
        self.shared.state.lock().break_level = false;
        Ok(())
    }

    fn set_break(&self, level: bool) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        state.break_level = level;
        Ok(())
    }

    fn set_rts(&self, level: bool) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        state.rts = level;
        Ok(())
    }

    fn set_dtr(&self, level: bool) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        state.dtr = level;
        Ok(())
    }

    fn wait_for_change(&self) -> DriverResult<bool> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        let entry_generation = state.line_generation;
        let deadline = Instant::now() + state.settings.timeout;
        while state.open
            && !state.immediate_timeout
            && state.line_generation == entry_generation
        {
            if self
                .shared
                .data_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        Ok(state.line_generation != entry_generation)
    }

    fn read_cts(&self) -> DriverResult<bool> {
        let state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        Ok(state.lines.cts)
    }

    fn read_dsr(&self) -> DriverResult<bool> {
        let state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        Ok(state.lines.dsr)
    }

    fn read_ri(&self) -> DriverResult<bool> {
        let state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        Ok(state.lines.ri)
    }

    fn read_cd(&self) -> DriverResult<bool> {
        let state = self.shared.state.lock();
        if !state.open {
            return Err(DriverError::NotOpen);
        }
        Ok(state.lines.cd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open_mock() -> MockDriver {
        let mock = MockDriver::new("MOCK0");
        mock.open().unwrap();
        mock.set_timeout(Duration::from_millis(50)).unwrap();
        mock
    }

    #[test]
    fn test_enqueue_and_read() {
        let mock = open_mock();
        mock.enqueue_read(b"Hello");

        let mut buf = [0u8; 5];
        let n = mock.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..n], b"Hello");
    }

    #[test]
    fn test_read_short_on_timeout() {
        let mock = open_mock();
        mock.enqueue_read(b"Hi");

        let mut buf = [0u8; 10];
        let n = mock.read(&mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..n], b"Hi");
    }

    #[test]
    fn test_read_blocks_until_fed() {
        let mock = open_mock();
        mock.set_timeout(Duration::from_secs(5)).unwrap();

        let reader = mock.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf).map(|n| buf[..n].to_vec())
        });

        std::thread::sleep(Duration::from_millis(20));
        mock.enqueue_read(b"ping");
        let read = handle.join().unwrap().unwrap();
        assert_eq!(read, b"ping");
    }

    #[test]
    fn test_write_logging() {
        let mock = open_mock();
        mock.write(b"Test1").unwrap();
        mock.write(b"Test2").unwrap();

        let log = mock.write_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], b"Test1");
        assert_eq!(log[1], b"Test2");
    }

    #[test]
    fn test_timeout_injection() {
        let mock = open_mock();
        mock.set_should_timeout(true);

        let mut buf = [0u8; 10];
        let result = mock.read(&mut buf);
        assert!(matches!(result, Err(DriverError::Timeout(_))));

        // One-shot: the next read succeeds.
        mock.enqueue_read(b"ok");
        let n = mock.read(&mut buf[..2]).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_closed_port_rejects_io() {
        let mock = MockDriver::new("MOCK0");
        let mut buf = [0u8; 1];
        assert!(matches!(mock.read(&mut buf), Err(DriverError::NotOpen)));
        assert!(matches!(mock.write(b"x"), Err(DriverError::NotOpen)));
    }

    #[test]
    fn test_flush_input_clears_queue() {
        let mock = open_mock();
        mock.enqueue_read(b"stale");
        mock.flush_input().unwrap();
        assert_eq!(mock.available_bytes(), 0);
    }

    #[test]
    fn test_wait_for_change_sees_line_flip() {
        let mock = open_mock();
        mock.set_timeout(Duration::from_secs(5)).unwrap();

        let waiter = mock.clone();
        let handle = std::thread::spawn(move || waiter.wait_for_change());

        std::thread::sleep(Duration::from_millis(20));
        mock.set_modem_lines(true, false, false, false);
        assert!(handle.join().unwrap().unwrap());
        assert!(mock.read_cts().unwrap());
    }

    #[test]
    fn test_settings_staged_while_closed() {
        let mock = MockDriver::new("MOCK0");
        mock.set_baud_rate(115200).unwrap();
        assert_eq!(mock.settings().baud_rate, 115200);
        assert_eq!(mock.reconfigure_count(), 1);
    }
}
