//! The concrete serial controller.
//!
//! [`SerialController`] mimics a plain serial-port interface: open the
//! device, read, write, reconfigure. It must be made *active* before any of
//! that works, and it adds a *locked active* reservation: while locked, any
//! attempt by another controller to take the active role is refused until
//! [`SerialController::unlock_active`] or
//! [`SerialController::make_inactive`] runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::controller::{
    make_active, Controller, ControllerCore, ControllerId, DEFAULT_DRAIN_TIMEOUT,
};
use crate::driver::{DataBits, FlowControl, Parity, SerialSettings, StopBits};
use crate::error::{Error, Result};
use crate::port::Port;

#[derive(Default)]
struct AmState {
    call_in_progress: bool,
    call_thread: Option<ThreadId>,
}

#[derive(Default)]
struct LockState {
    /// The flag `will_make_inactive` consults to refuse external
    /// preemption. Tentatively raised during `make_locked_active` so a
    /// concurrent takeover is refused even before the activation commits.
    locked: bool,
    /// Mirror backing `is_locked_active()`. Only raised once the controller
    /// is certainly locked and active, so the read stays prompt and honest
    /// mid-`make_locked_active`.
    locked_active: bool,
}

struct LockableInner {
    core: ControllerCore,
    /// Serializes the role-changing methods of this one controller.
    am_serializing: Mutex<()>,
    am_state: Mutex<AmState>,
    lock_state: Mutex<LockState>,
    /// Value `did_make_active` commits into both lock flags: true when the
    /// activation came from `make_locked_active`, false from `make_active`.
    set_locked_active: AtomicBool,
}

impl LockableInner {
    /// Whether the transition driving the current callback was requested by
    /// some other controller rather than one of our own role methods.
    fn transition_initiated_externally(&self) -> bool {
        let am = self.am_state.lock();
        !am.call_in_progress || am.call_thread != Some(thread::current().id())
    }
}

impl Controller for LockableInner {
    fn core(&self) -> &ControllerCore {
        &self.core
    }

    fn will_make_inactive(&self) -> Result<()> {
        // An external request is refused while locked. A self-initiated one
        // ignores the lock: the controller unlocks itself on success.
        if self.transition_initiated_externally() {
            let lock_state = self.lock_state.lock();
            if lock_state.locked {
                return Err(Error::refused(
                    self.core.id(),
                    self.core.description(),
                    "the controller is locked",
                ));
            }
        }

        self.core.block_access_calls()?;
        if !self
            .core
            .wait_for_all_access_calls_to_return(DEFAULT_DRAIN_TIMEOUT)?
        {
            return Err(Error::refused(
                self.core.id(),
                self.core.description(),
                "the controller is using the port",
            ));
        }
        Ok(())
    }

    fn did_make_inactive(&self) {
        // An inactive controller is never locked.
        let mut lock_state = self.lock_state.lock();
        lock_state.locked = false;
        lock_state.locked_active = false;
    }

    fn did_make_active(&self) -> Result<()> {
        let value = self.set_locked_active.load(Ordering::SeqCst);
        let mut lock_state = self.lock_state.lock();
        lock_state.locked = value;
        lock_state.locked_active = value;
        Ok(())
    }
}

/// Guard serializing one controller's role-changing methods and recording
/// which thread is inside one, so the transition callbacks can tell a
/// self-initiated change from an external takeover.
struct AmGuard<'a> {
    inner: &'a LockableInner,
    _serializing: MutexGuard<'a, ()>,
}

impl<'a> AmGuard<'a> {
    fn enter(inner: &'a LockableInner) -> Self {
        let serializing = inner.am_serializing.lock();
        {
            let mut am = inner.am_state.lock();
            am.call_in_progress = true;
            am.call_thread = Some(thread::current().id());
        }
        Self {
            inner,
            _serializing: serializing,
        }
    }
}

impl Drop for AmGuard<'_> {
    fn drop(&mut self) {
        self.inner.am_state.lock().call_in_progress = false;
    }
}

/// A serial-port controller with a lockable active reservation.
///
/// Dropping the controller removes it from the access list. That removal is
/// best-effort: if it is refused, the port is closed and the removal retried
/// once; a second failure panics, because a controller in the access list
/// must not outlive its owner. If the driver is frozen in an access call the
/// drop may block until the call returns.
pub struct SerialController {
    inner: Arc<LockableInner>,
}

impl SerialController {
    /// Create a controller for the given port. The controller starts
    /// inactive and outside the access list.
    pub fn new(port: &Port) -> Result<Self> {
        let core = ControllerCore::new(port, "SerialController", Vec::new())?;
        Ok(Self {
            inner: Arc::new(LockableInner {
                core,
                am_serializing: Mutex::new(()),
                am_state: Mutex::new(AmState::default()),
                lock_state: Mutex::new(LockState::default()),
                set_locked_active: AtomicBool::new(false),
            }),
        })
    }

    /// Create a controller for the named device.
    pub fn for_device(device_name: &str) -> Result<Self> {
        Self::new(&Port::new(device_name)?)
    }

    /// The shared controller handle, usable as a delegate of another
    /// controller bound to the same device.
    pub fn handle(&self) -> Arc<dyn Controller> {
        self.inner.clone()
    }

    /// This controller's process-unique id.
    pub fn id(&self) -> ControllerId {
        self.inner.core.id()
    }

    /// The port this controller is bound to.
    pub fn port(&self) -> &Port {
        self.inner.core.port()
    }

    /// The device name of the bound port.
    pub fn device_name(&self) -> &str {
        self.inner.core.device_name()
    }

    /// A description naming the controller type, device and id.
    pub fn description(&self) -> &str {
        self.inner.core.description()
    }

    // Access management.

    /// Whether this controller is currently active. May change at any time;
    /// only a locked controller is guaranteed to stay active.
    pub fn is_active(&self) -> bool {
        self.inner.core.is_active()
    }

    /// Whether this controller is locked active: active, and refusing all
    /// external requests to take the role away.
    pub fn is_locked_active(&self) -> bool {
        self.inner.lock_state.lock().locked_active
    }

    /// Make the controller active, without locking. A no-op when already
    /// active; an already locked-active controller stays locked.
    pub fn make_active(&self) -> Result<()> {
        let _guard = AmGuard::enter(&self.inner);
        self.inner.set_locked_active.store(false, Ordering::SeqCst);
        make_active(self.inner.clone())
    }

    /// Make the controller locked active: active, and refusing to hand the
    /// role over until unlocked. A no-op when already locked active.
    pub fn make_locked_active(&self) -> Result<()> {
        let _guard = AmGuard::enter(&self.inner);
        self.inner.set_locked_active.store(true, Ordering::SeqCst);
        // Raise the lock intent before requesting activation so a takeover
        // racing this call is refused rather than sneaking in between the
        // activation and the lock.
        self.inner.lock_state.lock().locked = true;

        match make_active(self.inner.clone()) {
            Ok(()) => {
                // Covers the already-active case where no transition fired
                // and did_make_active never ran.
                self.inner.lock_state.lock().locked_active = true;
                Ok(())
            }
            Err(err) => {
                if !self.inner.core.is_active() {
                    self.inner.lock_state.lock().locked = false;
                }
                Err(err)
            }
        }
    }

    /// Make the controller inactive, unlocking it in the same transition.
    /// If this fails the lock state is unchanged.
    pub fn make_inactive(&self) -> Result<()> {
        let _guard = AmGuard::enter(&self.inner);
        self.inner.core.make_inactive()
    }

    /// Drop the lock without giving up the active role. A no-op when not
    /// locked.
    pub fn unlock_active(&self) -> Result<()> {
        let _guard = AmGuard::enter(&self.inner);
        let mut lock_state = self.inner.lock_state.lock();
        lock_state.locked = false;
        lock_state.locked_active = false;
        Ok(())
    }

    /// Remove the controller (and any delegates) from the access list.
    pub fn remove_from_access(&self) -> Result<()> {
        let _guard = AmGuard::enter(&self.inner);
        self.inner.core.remove_from_access()
    }

    // Access functions. Each fails with `NotActiveController` unless the
    // controller is active.

    /// Open the serial device.
    pub fn open(&self) -> Result<()> {
        self.inner.core.open()
    }

    /// Open the serial device if it is not already open.
    pub fn ensure_open(&self) -> Result<()> {
        self.inner.core.ensure_open()
    }

    /// Whether the serial device is open.
    pub fn is_open(&self) -> Result<bool> {
        self.inner.core.is_open()
    }

    /// Close the serial device.
    pub fn close(&self) -> Result<()> {
        self.inner.core.close()
    }

    /// Number of bytes waiting in the receive buffer.
    pub fn available(&self) -> Result<usize> {
        self.inner.core.available()
    }

    /// Block until data is readable or the timeout lapses.
    pub fn wait_readable(&self) -> Result<bool> {
        self.inner.core.wait_readable()
    }

    /// Block for the transmission time of `count` bytes.
    pub fn wait_byte_times(&self, count: usize) -> Result<()> {
        self.inner.core.wait_byte_times(count)
    }

    /// Read into `buf`, returning the byte count before the timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.core.read(buf)
    }

    /// Read up to `size` bytes into a fresh buffer.
    pub fn read_bytes(&self, size: usize) -> Result<Vec<u8>> {
        self.inner.core.read_bytes(size)
    }

    /// Read a line of at most `max` bytes terminated by `eol`.
    pub fn readline(&self, max: usize, eol: &str) -> Result<String> {
        self.inner.core.readline(max, eol)
    }

    /// Read lines until the device goes quiet.
    pub fn readlines(&self, max: usize, eol: &str) -> Result<Vec<String>> {
        self.inner.core.readlines(max, eol)
    }

    /// Write `data`, returning the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.inner.core.write(data)
    }

    /// Current port settings.
    pub fn settings(&self) -> Result<SerialSettings> {
        self.inner.core.settings()
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> Result<u32> {
        self.inner.core.baud_rate()
    }

    /// Set the baud rate.
    pub fn set_baud_rate(&self, baud_rate: u32, only_if_different: bool) -> Result<()> {
        self.inner.core.set_baud_rate(baud_rate, only_if_different)
    }

    /// Current read/write timeout.
    pub fn timeout(&self) -> Result<Duration> {
        self.inner.core.timeout()
    }

    /// Set the read/write timeout.
    pub fn set_timeout(&self, timeout: Duration, only_if_different: bool) -> Result<()> {
        self.inner.core.set_timeout(timeout, only_if_different)
    }

    /// Current data-bits setting.
    pub fn data_bits(&self) -> Result<DataBits> {
        self.inner.core.data_bits()
    }

    /// Set the data-bits setting.
    pub fn set_data_bits(&self, data_bits: DataBits, only_if_different: bool) -> Result<()> {
        self.inner.core.set_data_bits(data_bits, only_if_different)
    }

    /// Current parity setting.
    pub fn parity(&self) -> Result<Parity> {
        self.inner.core.parity()
    }

    /// Set the parity setting.
    pub fn set_parity(&self, parity: Parity, only_if_different: bool) -> Result<()> {
        self.inner.core.set_parity(parity, only_if_different)
    }

    /// Current stop-bits setting.
    pub fn stop_bits(&self) -> Result<StopBits> {
        self.inner.core.stop_bits()
    }

    /// Set the stop-bits setting.
    pub fn set_stop_bits(&self, stop_bits: StopBits, only_if_different: bool) -> Result<()> {
        self.inner.core.set_stop_bits(stop_bits, only_if_different)
    }

    /// Current flow-control setting.
    pub fn flow_control(&self) -> Result<FlowControl> {
        self.inner.core.flow_control()
    }

    /// Set the flow-control setting.
    pub fn set_flow_control(&self, flow_control: FlowControl, only_if_different: bool) -> Result<()> {
        self.inner.core.set_flow_control(flow_control, only_if_different)
    }

    /// Apply a full settings block in field order.
    pub fn set_settings(&self, settings: &SerialSettings, only_if_different: bool) -> Result<()> {
        self.inner.core.set_settings(settings, only_if_different)
    }

    /// Block until all written data has been transmitted.
    pub fn flush(&self) -> Result<()> {
        self.inner.core.flush()
    }

    /// Discard the receive buffer.
    pub fn flush_input(&self) -> Result<()> {
        self.inner.core.flush_input()
    }

    /// Discard the transmit buffer.
    pub fn flush_output(&self) -> Result<()> {
        self.inner.core.flush_output()
    }

    /// Assert the break condition for `duration`.
    pub fn send_break(&self, duration: Duration) -> Result<()> {
        self.inner.core.send_break(duration)
    }

    /// Set or clear the break condition.
    pub fn set_break(&self, level: bool) -> Result<()> {
        self.inner.core.set_break(level)
    }

    /// Set the RTS line level.
    pub fn set_rts(&self, level: bool) -> Result<()> {
        self.inner.core.set_rts(level)
    }

    /// Set the DTR line level.
    pub fn set_dtr(&self, level: bool) -> Result<()> {
        self.inner.core.set_dtr(level)
    }

    /// Block until an input control line changes.
    pub fn wait_for_change(&self) -> Result<bool> {
        self.inner.core.wait_for_change()
    }

    /// Current CTS line level.
    pub fn get_cts(&self) -> Result<bool> {
        self.inner.core.get_cts()
    }

    /// Current DSR line level.
    pub fn get_dsr(&self) -> Result<bool> {
        self.inner.core.get_dsr()
    }

    /// Current RI line level.
    pub fn get_ri(&self) -> Result<bool> {
        self.inner.core.get_ri()
    }

    /// Current CD line level.
    pub fn get_cd(&self) -> Result<bool> {
        self.inner.core.get_cd()
    }
}

impl Drop for SerialController {
    fn drop(&mut self) {
        if let Err(first) = self.remove_from_access() {
            warn!(
                controller = self.description(),
                error = %first,
                "removal from access failed during drop; closing the port and retrying"
            );
            let _ = self.close();
            if let Err(second) = self.remove_from_access() {
                panic!(
                    "{} could not be removed from access during drop: {}",
                    self.description(),
                    second
                );
            }
        }
    }
}

impl std::fmt::Debug for SerialController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialController")
            .field("description", &self.description())
            .field("active", &self.is_active())
            .field("locked_active", &self.is_locked_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;

    fn controller(name: &str) -> SerialController {
        let port = Port::with_driver(name, MockDriver::new(name));
        SerialController::new(&port).unwrap()
    }

    #[test]
    fn test_plain_activation_does_not_lock() {
        let ctrl = controller("MOCK-PLAIN");
        ctrl.make_active().unwrap();
        assert!(ctrl.is_active());
        assert!(!ctrl.is_locked_active());
        ctrl.make_inactive().unwrap();
        assert!(!ctrl.is_active());
    }

    #[test]
    fn test_locked_activation_sets_both_flags() {
        let ctrl = controller("MOCK-LOCK");
        ctrl.make_locked_active().unwrap();
        assert!(ctrl.is_active());
        assert!(ctrl.is_locked_active());

        ctrl.unlock_active().unwrap();
        assert!(ctrl.is_active());
        assert!(!ctrl.is_locked_active());
    }

    #[test]
    fn test_self_inactivation_unlocks() {
        let ctrl = controller("MOCK-SELF");
        ctrl.make_locked_active().unwrap();
        // The lock never blocks the controller's own release.
        ctrl.make_inactive().unwrap();
        assert!(!ctrl.is_active());
        assert!(!ctrl.is_locked_active());
    }

    #[test]
    fn test_make_active_on_locked_controller_keeps_lock() {
        let ctrl = controller("MOCK-KEEP");
        ctrl.make_locked_active().unwrap();
        ctrl.make_active().unwrap();
        assert!(ctrl.is_locked_active());
    }

    #[test]
    fn test_lock_survives_redundant_locked_activation() {
        let ctrl = controller("MOCK-REDUNDANT");
        ctrl.make_locked_active().unwrap();
        ctrl.make_locked_active().unwrap();
        assert!(ctrl.is_locked_active());
    }
}
