//! The controller contract.
//!
//! A controller is an object that wants to use the serial device. All
//! controllers implement [`Controller`], which couples a [`ControllerCore`]
//! (identity, port handle, delegate list, and the forwarded role/I/O API)
//! with nine transition callbacks the mediator invokes while arbitrating
//! role changes.
//!
//! Only the *active* controller may perform I/O; every access method fails
//! with [`Error::NotActiveController`] otherwise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::driver::{DataBits, FlowControl, Parity, SerialSettings, StopBits};
use crate::error::{Error, Result};
use crate::mediator::AccessMediator;
use crate::port::Port;

/// Timeout used by the default `will_make_inactive` implementation while
/// draining in-flight access calls.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(1500);

static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a controller, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(u64);

impl ControllerId {
    #[cfg(test)]
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    fn next() -> Self {
        Self(NEXT_CONTROLLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn to_raw(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

impl std::fmt::Display for ControllerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity and display label of a controller, used by the mediator for
/// permission checks and error messages.
#[derive(Debug, Clone)]
pub struct ControllerIdentity {
    id: ControllerId,
    label: String,
}

impl ControllerIdentity {
    pub(crate) fn id(&self) -> ControllerId {
        self.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }
}

/// A participant in the access arbitration protocol.
///
/// Implementors embed a [`ControllerCore`] and may override any of the
/// transition callbacks. All callbacks run on the thread that initiated the
/// transition, and the mediator guarantees their pairing: a `will_*` that
/// returns normally is always followed by exactly one of its `did_*` /
/// `did_cancel_*` counterparts.
pub trait Controller: Send + Sync {
    /// The embedded core carrying identity, port and delegates.
    fn core(&self) -> &ControllerCore;

    /// Called before the controller is removed from the access list, for
    /// every member of the list (the current controller first). Returning an
    /// error (conventionally [`Error::Refused`]) cancels the current
    /// controller change.
    ///
    /// Active-controller changes on delegates are permitted from inside this
    /// callback; current-controller changes are not.
    fn will_remove(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the controller is about to be made inactive.
    ///
    /// Implementations **must** block access calls and wait until all
    /// in-flight access calls have returned, or fail. Returning without
    /// doing so aborts the transition with a logic error. An implementation
    /// may refuse the transition by returning [`Error::Refused`].
    fn will_make_inactive(&self) -> Result<()> {
        let core = self.core();
        core.block_access_calls()?;
        if !core.wait_for_all_access_calls_to_return(DEFAULT_DRAIN_TIMEOUT)? {
            return Err(Error::refused(
                core.id(),
                core.description(),
                "access calls have not returned",
            ));
        }
        Ok(())
    }

    /// Called just before the controller becomes active, with the mediator's
    /// internal state held. Implementations must only touch controller-local
    /// state and must not call transition utilities or role methods.
    fn will_make_active(&self) {}

    /// Called after the controller has become active. A failure propagates
    /// to the caller that requested the change, but the controller stays
    /// active.
    fn did_make_active(&self) -> Result<()> {
        Ok(())
    }

    /// Called after the controller has been made inactive.
    fn did_make_inactive(&self) {}

    /// Called instead of `did_make_inactive` when the transition was
    /// cancelled after `will_make_inactive` returned (a broken gating
    /// contract).
    fn did_cancel_make_inactive(&self) {}

    /// Called after the controller has been added to the access list.
    /// Deepest delegates hear first; the new current controller last.
    fn did_add(&self) {}

    /// Called after the controller has been removed from the access list.
    fn did_remove(&self) {}

    /// Called instead of `did_remove` when a current controller change was
    /// cancelled after this controller's `will_remove` had accepted it.
    fn did_cancel_remove(&self) {}
}

/// Make the controller the active controller, queueing and serializing the
/// transition with any concurrent role changes on the same device.
///
/// If the controller is already in the access list this is an
/// active-controller change; otherwise a current-controller change replaces
/// the whole access list. Either may be refused by the controllers involved.
pub fn make_active(controller: Arc<dyn Controller>) -> Result<()> {
    let mediator = controller.core().mediator.clone();
    mediator.make_active(controller)
}

/// Identity, port binding and forwarded API shared by all controllers.
///
/// The core is created once in a controller's constructor, together with the
/// full (and thereafter immutable) delegate list.
pub struct ControllerCore {
    port: Port,
    mediator: Arc<AccessMediator>,
    identity: ControllerIdentity,
    delegates: Vec<Arc<dyn Controller>>,
}

impl ControllerCore {
    /// Create a core bound to `port`, with `kind` naming the controller type
    /// in descriptions and `delegates` fixed for the controller's lifetime.
    ///
    /// Each delegate is checked at registration: it must not be the
    /// controller itself, must not already be registered, must not introduce
    /// a delegation cycle, and must be bound to the same device.
    pub fn new(port: &Port, kind: &str, delegates: Vec<Arc<dyn Controller>>) -> Result<Self> {
        let id = ControllerId::next();
        let identity = ControllerIdentity {
            id,
            label: format!("{} for '{}' ({})", kind, port.device_name(), id),
        };
        let mut core = Self {
            port: port.clone(),
            mediator: port.mediator(),
            identity,
            delegates: Vec::with_capacity(delegates.len()),
        };
        for delegate in delegates {
            core.register_delegate(delegate)?;
        }
        debug!(controller = %core.identity.label, "controller created");
        Ok(core)
    }

    /// Register one delegate during construction.
    fn register_delegate(&mut self, delegate: Arc<dyn Controller>) -> Result<()> {
        let delegate_core = delegate.core();
        if delegate_core.identity.id == self.identity.id {
            return Err(Error::invalid("a controller cannot delegate to itself"));
        }
        if self.has_first_degree_delegate(delegate_core.identity.id) {
            return Err(Error::invalid(
                "cannot register the same delegate more than once",
            ));
        }
        if delegate_core.has_in_subtree(self.identity.id) {
            return Err(Error::invalid("delegation cycles are not allowed"));
        }
        if delegate_core.port.device_name() != self.port.device_name() {
            return Err(Error::invalid(format!(
                "delegate {} is bound to '{}', not '{}'",
                delegate_core.identity.label,
                delegate_core.port.device_name(),
                self.port.device_name()
            )));
        }
        self.delegates.push(delegate);
        Ok(())
    }

    fn has_first_degree_delegate(&self, id: ControllerId) -> bool {
        self.delegates.iter().any(|d| d.core().identity.id == id)
    }

    /// Whether `id` names this controller's delegate or sub-delegate of any
    /// degree.
    pub(crate) fn has_in_subtree(&self, id: ControllerId) -> bool {
        self.delegates
            .iter()
            .any(|d| d.core().identity.id == id || d.core().has_in_subtree(id))
    }

    /// This controller's process-unique id.
    pub fn id(&self) -> ControllerId {
        self.identity.id
    }

    /// The port this controller is bound to.
    pub fn port(&self) -> &Port {
        &self.port
    }

    /// The device name of the bound port.
    pub fn device_name(&self) -> &str {
        self.port.device_name()
    }

    /// A description of the form `"<kind> for '<device>' (#<id>)"`.
    pub fn description(&self) -> &str {
        &self.identity.label
    }

    // Role management.

    /// Whether this controller is currently the active controller. The
    /// answer may be stale by the time it is used; only a refusal from the
    /// transition callbacks can keep a controller active.
    pub fn is_active(&self) -> bool {
        self.mediator.is_active(self.identity.id)
    }

    /// Relinquish the active role if held. A no-op when inactive.
    pub fn make_inactive(&self) -> Result<()> {
        self.mediator.make_inactive(&self.identity)
    }

    /// Remove this controller (and its delegates) from the access list.
    ///
    /// Only the current controller can be removed; removing a controller
    /// that sits in the access list as someone's delegate is a logic error.
    /// A no-op when not in the access list.
    pub fn remove_from_access(&self) -> Result<()> {
        self.mediator.remove_from_access(&self.identity)
    }

    // Transition utilities, valid only on the transition thread.

    /// Block access calls made from threads other than the transition
    /// thread. Valid only from a transition callback or subcall.
    pub fn block_access_calls(&self) -> Result<()> {
        self.mediator.block_access_calls(&self.identity)
    }

    /// Unblock access calls. They are also unblocked automatically when the
    /// transition terminates. Valid only from a transition callback or
    /// subcall.
    pub fn unblock_access_calls(&self) -> Result<()> {
        self.mediator.unblock_access_calls(&self.identity)
    }

    /// Wait until all in-flight access calls have returned. Returns `false`
    /// if the timeout lapsed first. Valid only from a transition callback or
    /// subcall.
    pub fn wait_for_all_access_calls_to_return(&self, timeout: Duration) -> Result<bool> {
        self.mediator
            .wait_for_all_access_calls_to_return(&self.identity, timeout)
    }

    // Access functions. Each fails with `NotActiveController` unless this
    // controller is active at call entry.

    /// Open the serial device.
    pub fn open(&self) -> Result<()> {
        self.mediator.open(&self.identity)
    }

    /// Open the serial device if it is not already open.
    pub fn ensure_open(&self) -> Result<()> {
        self.mediator.ensure_open(&self.identity)
    }

    /// Whether the serial device is open.
    pub fn is_open(&self) -> Result<bool> {
        self.mediator.is_open(&self.identity)
    }

    /// Close the serial device.
    pub fn close(&self) -> Result<()> {
        self.mediator.close(&self.identity)
    }

    /// Number of bytes waiting in the receive buffer.
    pub fn available(&self) -> Result<usize> {
        self.mediator.available(&self.identity)
    }

    /// Block until data is readable or the timeout lapses.
    pub fn wait_readable(&self) -> Result<bool> {
        self.mediator.wait_readable(&self.identity)
    }

    /// Block for the transmission time of `count` bytes.
    pub fn wait_byte_times(&self, count: usize) -> Result<()> {
        self.mediator.wait_byte_times(&self.identity, count)
    }

    /// Read into `buf`, returning the number of bytes read before the
    /// timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.mediator.read(&self.identity, buf)
    }

    /// Read up to `size` bytes into a fresh buffer.
    pub fn read_bytes(&self, size: usize) -> Result<Vec<u8>> {
        self.mediator.read_bytes(&self.identity, size)
    }

    /// Read a line of at most `max` bytes terminated by `eol`.
    pub fn readline(&self, max: usize, eol: &str) -> Result<String> {
        self.mediator.readline(&self.identity, max, eol)
    }

    /// Read lines until the device goes quiet, up to `max` bytes in total.
    pub fn readlines(&self, max: usize, eol: &str) -> Result<Vec<String>> {
        self.mediator.readlines(&self.identity, max, eol)
    }

    /// Write `data`, returning the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.mediator.write(&self.identity, data)
    }

    /// Current port settings.
    pub fn settings(&self) -> Result<SerialSettings> {
        self.mediator.settings(&self.identity)
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> Result<u32> {
        Ok(self.settings()?.baud_rate)
    }

    /// Set the baud rate, optionally skipping a redundant reconfiguration.
    pub fn set_baud_rate(&self, baud_rate: u32, only_if_different: bool) -> Result<()> {
        self.mediator
            .set_baud_rate(&self.identity, baud_rate, only_if_different)
    }

    /// Current read/write timeout.
    pub fn timeout(&self) -> Result<Duration> {
        Ok(self.settings()?.timeout)
    }

    /// Set the read/write timeout.
    pub fn set_timeout(&self, timeout: Duration, only_if_different: bool) -> Result<()> {
        self.mediator
            .set_timeout(&self.identity, timeout, only_if_different)
    }

    /// Current data-bits setting.
    pub fn data_bits(&self) -> Result<DataBits> {
        Ok(self.settings()?.data_bits)
    }

    /// Set the data-bits setting.
    pub fn set_data_bits(&self, data_bits: DataBits, only_if_different: bool) -> Result<()> {
        self.mediator
            .set_data_bits(&self.identity, data_bits, only_if_different)
    }

    /// Current parity setting.
    pub fn parity(&self) -> Result<Parity> {
        Ok(self.settings()?.parity)
    }

    /// Set the parity setting.
    pub fn set_parity(&self, parity: Parity, only_if_different: bool) -> Result<()> {
        self.mediator
            .set_parity(&self.identity, parity, only_if_different)
    }

    /// Current stop-bits setting.
    pub fn stop_bits(&self) -> Result<StopBits> {
        Ok(self.settings()?.stop_bits)
    }

    /// Set the stop-bits setting.
    pub fn set_stop_bits(&self, stop_bits: StopBits, only_if_different: bool) -> Result<()> {
        self.mediator
            .set_stop_bits(&self.identity, stop_bits, only_if_different)
    }

    /// Current flow-control setting.
    pub fn flow_control(&self) -> Result<FlowControl> {
        Ok(self.settings()?.flow_control)
    }

    /// Set the flow-control setting.
    pub fn set_flow_control(
        &self,
        flow_control: FlowControl,
        only_if_different: bool,
    ) -> Result<()> {
        self.mediator
            .set_flow_control(&self.identity, flow_control, only_if_different)
    }

    /// Apply a full settings block, in field order, stopping at the first
    /// failure.
    pub fn set_settings(&self, settings: &SerialSettings, only_if_different: bool) -> Result<()> {
        self.mediator
            .set_settings(&self.identity, settings, only_if_different)
    }

    /// Block until all written data has been transmitted.
    pub fn flush(&self) -> Result<()> {
        self.mediator.flush(&self.identity)
    }

    /// Discard the receive buffer.
    pub fn flush_input(&self) -> Result<()> {
        self.mediator.flush_input(&self.identity)
    }

    /// Discard the transmit buffer.
    pub fn flush_output(&self) -> Result<()> {
        self.mediator.flush_output(&self.identity)
    }

    /// Assert the break condition for `duration`.
    pub fn send_break(&self, duration: Duration) -> Result<()> {
        self.mediator.send_break(&self.identity, duration)
    }

    /// Set or clear the break condition.
    pub fn set_break(&self, level: bool) -> Result<()> {
        self.mediator.set_break(&self.identity, level)
    }

    /// Set the RTS line level.
    pub fn set_rts(&self, level: bool) -> Result<()> {
        self.mediator.set_rts(&self.identity, level)
    }

    /// Set the DTR line level.
    pub fn set_dtr(&self, level: bool) -> Result<()> {
        self.mediator.set_dtr(&self.identity, level)
    }

    /// Block until an input control line changes.
    pub fn wait_for_change(&self) -> Result<bool> {
        self.mediator.wait_for_change(&self.identity)
    }

    /// Current CTS line level.
    pub fn get_cts(&self) -> Result<bool> {
        self.mediator.read_cts(&self.identity)
    }

    /// Current DSR line level.
    pub fn get_dsr(&self) -> Result<bool> {
        self.mediator.read_dsr(&self.identity)
    }

    /// Current RI line level.
    pub fn get_ri(&self) -> Result<bool> {
        self.mediator.read_ri(&self.identity)
    }

    /// Current CD line level.
    pub fn get_cd(&self) -> Result<bool> {
        self.mediator.read_cd(&self.identity)
    }
}

impl std::fmt::Debug for ControllerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerCore")
            .field("identity", &self.identity.label)
            .field("delegates", &self.delegates.len())
            .finish()
    }
}

/// Expand the delegate tree rooted at `root` into the access list: the root
/// first, then its delegates, then theirs, breadth first.
pub(crate) fn access_list(root: &Arc<dyn Controller>) -> Vec<Arc<dyn Controller>> {
    let mut list = vec![root.clone()];
    let mut next = 0;
    while next < list.len() {
        let delegates = list[next].core().delegates.to_vec();
        list.extend(delegates);
        next += 1;
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;

    struct Probe {
        core: ControllerCore,
    }

    impl Probe {
        fn new(port: &Port, delegates: Vec<Arc<dyn Controller>>) -> Arc<Self> {
            Arc::new(Self {
                core: ControllerCore::new(port, "probe", delegates).unwrap(),
            })
        }
    }

    impl Controller for Probe {
        fn core(&self) -> &ControllerCore {
            &self.core
        }
    }

    fn mock_port(name: &str) -> Port {
        Port::with_driver(name, MockDriver::new(name))
    }

    #[test]
    fn test_access_list_is_breadth_first() {
        let port = mock_port("MOCK-BFS");
        let grandchild = Probe::new(&port, vec![]);
        let child_a = Probe::new(&port, vec![grandchild.clone()]);
        let child_b = Probe::new(&port, vec![]);
        let root = Probe::new(&port, vec![child_a.clone(), child_b.clone()]);

        let root_dyn: Arc<dyn Controller> = root.clone();
        let list = access_list(&root_dyn);
        let ids: Vec<_> = list.iter().map(|c| c.core().id()).collect();
        assert_eq!(
            ids,
            vec![
                root.core.id(),
                child_a.core.id(),
                child_b.core.id(),
                grandchild.core.id()
            ]
        );
    }

    #[test]
    fn test_subtree_search_spans_degrees() {
        let port = mock_port("MOCK-SUBTREE");
        let grandchild = Probe::new(&port, vec![]);
        let child = Probe::new(&port, vec![grandchild.clone()]);
        let root = Probe::new(&port, vec![child.clone()]);

        assert!(root.core.has_in_subtree(child.core.id()));
        assert!(root.core.has_in_subtree(grandchild.core.id()));
        assert!(!root.core.has_in_subtree(root.core.id()));
        assert!(!child.core.has_in_subtree(root.core.id()));
    }

    #[test]
    fn test_duplicate_delegate_is_rejected() {
        let port = mock_port("MOCK-DUP");
        let child = Probe::new(&port, vec![]);
        let result = ControllerCore::new(
            &port,
            "probe",
            vec![child.clone() as Arc<dyn Controller>, child.clone()],
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_cross_device_delegate_is_rejected() {
        let port_a = mock_port("MOCK-A");
        let port_b = mock_port("MOCK-B");
        let stranger = Probe::new(&port_b, vec![]);
        let result = ControllerCore::new(&port_a, "probe", vec![stranger as Arc<dyn Controller>]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_description_format() {
        let port = mock_port("MOCK-DESC");
        let probe = Probe::new(&port, vec![]);
        let description = probe.core.description();
        assert!(description.starts_with("probe for 'MOCK-DESC' (#"));
        assert!(description.ends_with(')'));
    }
}
