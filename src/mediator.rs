//! Per-device access mediator.
//!
//! The mediator is the arbiter behind every controller bound to one device.
//! It owns the driver facade, the gate that access calls pass through, the
//! FIFO ticket queue that serializes role transitions, and the callback
//! protocol that lets controllers veto or observe those transitions.
//!
//! Three RAII guards structure the implementation:
//!
//! - [`AccessGuard`] wraps every I/O entry point: it waits out the gate,
//!   verifies the caller is the active controller, and maintains the
//!   unreturned-call counter.
//! - [`TransitionTicket`] queues and serializes transitions; exactly one
//!   ticket is live at a time and it records the transition thread.
//! - [`AccessUnblocker`] reopens the gate on every exit path of a
//!   transition, completed or cancelled.
//!
//! Lock order: state mutex, then driver serialize mutex. The state mutex is
//! never held across driver calls or controller callbacks, with one
//! exception: `will_make_active`, which is documented as local-state-only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::controller::{access_list, Controller, ControllerId, ControllerIdentity};
use crate::driver::facade::DriverFacade;
use crate::driver::{DataBits, FlowControl, Parity, SerialDriver, SerialSettings, StopBits};
use crate::error::{Error, Result};

#[derive(Default)]
struct MediatorState {
    /// Root of the current access list.
    current: Option<Arc<dyn Controller>>,
    /// The controller permitted to perform I/O; always in the access list.
    active: Option<Arc<dyn Controller>>,
    /// Gate for access calls made off the transition thread.
    access_unblocked: bool,
    /// In-flight access calls.
    unreturned_calls: usize,
    transition_in_progress: bool,
    /// Meaningful only while a transition is in progress.
    transition_thread: Option<ThreadId>,
}

#[derive(Default)]
struct TicketQueue {
    next_ticket: u64,
    ready_ticket: u64,
}

/// Arbitrates access to one serial device.
///
/// One mediator exists per device while any controller is bound to it; the
/// device object re-creates it on demand.
pub(crate) struct AccessMediator {
    device_name: String,
    driver: DriverFacade,
    state: Mutex<MediatorState>,
    /// Signalled when the gate reopens or a transition terminates.
    access_unblocked_cond: Condvar,
    /// Signalled when the last in-flight access call returns.
    all_returned_cond: Condvar,
    queue: Mutex<TicketQueue>,
    queue_cond: Condvar,
    /// Mirrors of the active/current controller ids for lock-free
    /// instantaneous reads. Written only under the state mutex; 0 is none.
    active_id: AtomicU64,
    current_id: AtomicU64,
    /// Whether a nested active-controller change is currently legal. Only
    /// meaningful while a transition is in progress.
    concurrent_change_allowed: AtomicBool,
}

impl AccessMediator {
    pub(crate) fn new(device_name: impl Into<String>, driver: Box<dyn SerialDriver>) -> Self {
        Self {
            device_name: device_name.into(),
            driver: DriverFacade::new(driver),
            state: Mutex::new(MediatorState {
                access_unblocked: true,
                ..MediatorState::default()
            }),
            access_unblocked_cond: Condvar::new(),
            all_returned_cond: Condvar::new(),
            queue: Mutex::new(TicketQueue::default()),
            queue_cond: Condvar::new(),
            active_id: AtomicU64::new(0),
            current_id: AtomicU64::new(0),
            concurrent_change_allowed: AtomicBool::new(false),
        }
    }

    /// Instantaneous check; the answer may be stale as soon as it is read.
    pub(crate) fn is_active(&self, id: ControllerId) -> bool {
        self.active_id.load(Ordering::SeqCst) == id.to_raw()
    }

    /// Instantaneous read of the current controller's id.
    pub(crate) fn current_controller_id(&self) -> Option<ControllerId> {
        ControllerId::from_raw(self.current_id.load(Ordering::SeqCst))
    }

    // ------------------------------------------------------------------
    // Role management
    // ------------------------------------------------------------------

    pub(crate) fn make_active(&self, controller: Arc<dyn Controller>) -> Result<()> {
        let id = controller.core().id();
        debug!(
            controller = controller.core().description(),
            "make_active requested"
        );
        if self.should_perform_concurrent_active_change(id) {
            // Only the transition thread can reach this branch, so the
            // active controller cannot move underneath us even though the
            // state mutex is unlocked.
            if !self.is_active(id) {
                self.perform_active_controller_change(Some(controller))?;
            }
            return Ok(());
        }

        let _ticket = TransitionTicket::acquire(self);
        // The type of change can only be decided after waiting in the
        // queue: the access list may have moved while we were queued.
        let in_list = {
            let state = self.state.lock();
            Self::in_access_list_locked(&state, id)
        };
        if in_list {
            if !self.is_active(id) {
                self.perform_active_controller_change(Some(controller))?;
            }
            Ok(())
        } else {
            self.perform_current_controller_change(Some(controller))
        }
    }

    pub(crate) fn make_inactive(&self, who: &ControllerIdentity) -> Result<()> {
        debug!(controller = who.label(), "make_inactive requested");
        if self.should_perform_concurrent_active_change(who.id()) {
            if self.is_active(who.id()) {
                self.perform_active_controller_change(None)?;
            }
            return Ok(());
        }

        let _ticket = TransitionTicket::acquire(self);
        if self.is_active(who.id()) {
            self.perform_active_controller_change(None)?;
        }
        Ok(())
    }

    pub(crate) fn remove_from_access(&self, who: &ControllerIdentity) -> Result<()> {
        debug!(controller = who.label(), "remove_from_access requested");
        // Removal always needs a current controller change, which is always
        // queued.
        let _ticket = TransitionTicket::acquire(self);
        let (in_list, is_root) = {
            let state = self.state.lock();
            (
                Self::in_access_list_locked(&state, who.id()),
                state
                    .current
                    .as_ref()
                    .is_some_and(|root| root.core().id() == who.id()),
            )
        };
        if !in_list {
            return Ok(());
        }
        if !is_root {
            // Removing a delegate while its delegating controller still
            // references it means that controller broke its obligation to
            // keep delegates alive.
            return Err(Error::logic(format!(
                "cannot remove {} from access while it is another controller's delegate",
                who.label()
            )));
        }
        self.perform_current_controller_change(None)
    }

    /// Whether a requested change may run nested inside the current
    /// controller change in progress on this thread. True only between the
    /// `will_remove` and `did_cancel_remove` phases, on the transition
    /// thread, for a controller in the current access list.
    ///
    /// The result stays valid after the lock drops: every input is written
    /// only on the transition thread, and a non-transition thread can never
    /// become the transition thread except through its own ticket.
    fn should_perform_concurrent_active_change(&self, id: ControllerId) -> bool {
        let state = self.state.lock();
        state.transition_in_progress
            && self.concurrent_change_allowed.load(Ordering::SeqCst)
            && state.transition_thread == Some(thread::current().id())
            && Self::in_access_list_locked(&state, id)
    }

    fn in_access_list_locked(state: &MediatorState, id: ControllerId) -> bool {
        match &state.current {
            Some(root) => root.core().id() == id || root.core().has_in_subtree(id),
            None => false,
        }
    }

    /// Active-controller change: move the active role within the current
    /// access list (or to nobody) without touching the list itself.
    fn perform_active_controller_change(&self, new: Option<Arc<dyn Controller>>) -> Result<()> {
        let _unblocker = AccessUnblocker::new(self);
        self.perform_transition(new.clone(), false)?;
        if let Some(new) = new {
            // A failure here propagates, but the controller stays active.
            new.did_make_active()?;
        }
        Ok(())
    }

    /// Current-controller change: replace the root of the access list,
    /// notifying every outgoing member (root first) and every incoming
    /// member (deepest delegates first).
    fn perform_current_controller_change(&self, new_root: Option<Arc<dyn Controller>>) -> Result<()> {
        let _unblocker = AccessUnblocker::new(self);

        // No lock needed beyond the snapshot: current controller changes are
        // never concurrent, so `current` cannot move while we work.
        let old_root = self.state.lock().current.clone();
        let old_list = old_root.as_ref().map(access_list).unwrap_or_default();

        // The concurrency flag must be up during will_remove (and
        // did_cancel_remove) and down for every other callback.
        self.concurrent_change_allowed.store(true, Ordering::SeqCst);

        let mut notified = 0usize;
        let mut outcome = Ok(());
        for member in &old_list {
            if let Err(err) = member.will_remove() {
                outcome = Err(err);
                break;
            }
            notified += 1;
        }

        if outcome.is_ok() {
            self.concurrent_change_allowed.store(false, Ordering::SeqCst);
            outcome = self.perform_transition(new_root.clone(), true);
        }

        if let Err(err) = outcome {
            // Raising the flag again is required when the failure came from
            // will_make_inactive; redundant but harmless for will_remove.
            self.concurrent_change_allowed.store(true, Ordering::SeqCst);
            for member in &old_list[..notified] {
                member.did_cancel_remove();
            }
            warn!(
                device = %self.device_name,
                error = %err,
                "current controller change cancelled"
            );
            return Err(err);
        }

        for member in &old_list {
            member.did_remove();
        }

        if let Some(root) = new_root {
            // did_add runs in reverse list order: highest-degree delegates
            // first, the new current controller last.
            let new_list = access_list(&root);
            for member in new_list.iter().rev() {
                member.did_add();
            }
            root.did_make_active()?;
        }
        Ok(())
    }

    /// Shared tail of both change kinds: retire the old active controller
    /// through its callbacks, verify the gate is shut and the device idle,
    /// and commit the new active (and optionally current) controller.
    fn perform_transition(
        &self,
        new: Option<Arc<dyn Controller>>,
        also_set_current: bool,
    ) -> Result<()> {
        let old_active = self.state.lock().active.clone();

        // A conforming will_make_inactive blocks access calls and drains
        // the in-flight counter before returning.
        if let Some(old) = &old_active {
            old.will_make_inactive()?;
        }

        {
            let mut state = self.state.lock();

            if state.access_unblocked {
                match &old_active {
                    Some(old) => {
                        let message = format!(
                            "access calls must be blocked in will_make_inactive ({})",
                            old.core().description()
                        );
                        drop(state);
                        old.did_cancel_make_inactive();
                        return Err(Error::logic(message));
                    }
                    None => state.access_unblocked = false,
                }
            }

            if state.unreturned_calls > 0 {
                let count = state.unreturned_calls;
                match &old_active {
                    Some(old) => {
                        let message = format!(
                            "{} unreturned access calls after will_make_inactive ({})",
                            count,
                            old.core().description()
                        );
                        drop(state);
                        old.did_cancel_make_inactive();
                        return Err(Error::logic(message));
                    }
                    None => {
                        drop(state);
                        return Err(Error::logic(
                            "unreturned access calls with no active controller",
                        ));
                    }
                }
            }

            if let Some(new) = &new {
                new.will_make_active();
            }

            state.active = new.clone();
            self.active_id.store(
                new.as_ref().map(|c| c.core().id().to_raw()).unwrap_or(0),
                Ordering::SeqCst,
            );
            if also_set_current {
                state.current = new.clone();
                self.current_id.store(
                    new.as_ref().map(|c| c.core().id().to_raw()).unwrap_or(0),
                    Ordering::SeqCst,
                );
            }
        }

        debug!(
            device = %self.device_name,
            active = ?new.as_ref().map(|c| c.core().description()),
            "transition committed"
        );

        if let Some(old) = &old_active {
            old.did_make_inactive();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transition utilities
    // ------------------------------------------------------------------

    pub(crate) fn block_access_calls(&self, who: &ControllerIdentity) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_transition_thread_locked(&state, who, "block_access_calls")?;
        self.ensure_active_locked(&state, who, "block_access_calls")?;
        state.access_unblocked = false;
        Ok(())
    }

    pub(crate) fn unblock_access_calls(&self, who: &ControllerIdentity) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_transition_thread_locked(&state, who, "unblock_access_calls")?;
        self.ensure_active_locked(&state, who, "unblock_access_calls")?;
        state.access_unblocked = true;
        drop(state);
        self.access_unblocked_cond.notify_all();
        Ok(())
    }

    pub(crate) fn wait_for_all_access_calls_to_return(
        &self,
        who: &ControllerIdentity,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        self.ensure_transition_thread_locked(&state, who, "wait_for_all_access_calls_to_return")?;
        self.ensure_active_locked(&state, who, "wait_for_all_access_calls_to_return")?;
        while state.unreturned_calls > 0 {
            if self
                .all_returned_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        Ok(state.unreturned_calls == 0)
    }

    fn ensure_active_locked(
        &self,
        state: &MediatorState,
        who: &ControllerIdentity,
        operation: &'static str,
    ) -> Result<()> {
        let active = state
            .active
            .as_ref()
            .is_some_and(|a| a.core().id() == who.id());
        if active {
            Ok(())
        } else {
            Err(Error::not_active(who.label(), operation))
        }
    }

    fn ensure_transition_thread_locked(
        &self,
        state: &MediatorState,
        who: &ControllerIdentity,
        operation: &'static str,
    ) -> Result<()> {
        if !state.transition_in_progress
            || state.transition_thread != Some(thread::current().id())
        {
            return Err(Error::logic(format!(
                "{} is allowed only from a transition callback or subcall ({})",
                operation,
                who.label()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Access functions
    // ------------------------------------------------------------------

    pub(crate) fn open(&self, who: &ControllerIdentity) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "open")?;
        Ok(self.driver.open()?)
    }

    pub(crate) fn ensure_open(&self, who: &ControllerIdentity) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "ensure_open")?;
        Ok(self.driver.ensure_open()?)
    }

    pub(crate) fn is_open(&self, who: &ControllerIdentity) -> Result<bool> {
        let _guard = AccessGuard::enter(self, who, "is_open")?;
        Ok(self.driver.is_open())
    }

    pub(crate) fn close(&self, who: &ControllerIdentity) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "close")?;
        Ok(self.driver.close()?)
    }

    pub(crate) fn available(&self, who: &ControllerIdentity) -> Result<usize> {
        let _guard = AccessGuard::enter(self, who, "available")?;
        Ok(self.driver.available()?)
    }

    pub(crate) fn wait_readable(&self, who: &ControllerIdentity) -> Result<bool> {
        let _guard = AccessGuard::enter(self, who, "wait_readable")?;
        Ok(self.driver.wait_readable()?)
    }

    pub(crate) fn wait_byte_times(&self, who: &ControllerIdentity, count: usize) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "wait_byte_times")?;
        Ok(self.driver.wait_byte_times(count)?)
    }

    pub(crate) fn read(&self, who: &ControllerIdentity, buf: &mut [u8]) -> Result<usize> {
        let _guard = AccessGuard::enter(self, who, "read")?;
        Ok(self.driver.read(buf)?)
    }

    pub(crate) fn read_bytes(&self, who: &ControllerIdentity, size: usize) -> Result<Vec<u8>> {
        let _guard = AccessGuard::enter(self, who, "read_bytes")?;
        Ok(self.driver.read_bytes(size)?)
    }

    pub(crate) fn readline(
        &self,
        who: &ControllerIdentity,
        max: usize,
        eol: &str,
    ) -> Result<String> {
        let _guard = AccessGuard::enter(self, who, "readline")?;
        Ok(self.driver.readline(max, eol)?)
    }

    pub(crate) fn readlines(
        &self,
        who: &ControllerIdentity,
        max: usize,
        eol: &str,
    ) -> Result<Vec<String>> {
        let _guard = AccessGuard::enter(self, who, "readlines")?;
        Ok(self.driver.readlines(max, eol)?)
    }

    pub(crate) fn write(&self, who: &ControllerIdentity, data: &[u8]) -> Result<usize> {
        let _guard = AccessGuard::enter(self, who, "write")?;
        Ok(self.driver.write(data)?)
    }

    pub(crate) fn settings(&self, who: &ControllerIdentity) -> Result<SerialSettings> {
        let _guard = AccessGuard::enter(self, who, "settings")?;
        Ok(self.driver.settings())
    }

    pub(crate) fn set_baud_rate(
        &self,
        who: &ControllerIdentity,
        baud_rate: u32,
        only_if_different: bool,
    ) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_baud_rate")?;
        Ok(self.driver.set_baud_rate(baud_rate, only_if_different)?)
    }

    pub(crate) fn set_timeout(
        &self,
        who: &ControllerIdentity,
        timeout: Duration,
        only_if_different: bool,
    ) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_timeout")?;
        Ok(self.driver.set_timeout(timeout, only_if_different)?)
    }

    pub(crate) fn set_data_bits(
        &self,
        who: &ControllerIdentity,
        data_bits: DataBits,
        only_if_different: bool,
    ) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_data_bits")?;
        Ok(self.driver.set_data_bits(data_bits, only_if_different)?)
    }

    pub(crate) fn set_parity(
        &self,
        who: &ControllerIdentity,
        parity: Parity,
        only_if_different: bool,
    ) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_parity")?;
        Ok(self.driver.set_parity(parity, only_if_different)?)
    }

    pub(crate) fn set_stop_bits(
        &self,
        who: &ControllerIdentity,
        stop_bits: StopBits,
        only_if_different: bool,
    ) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_stop_bits")?;
        Ok(self.driver.set_stop_bits(stop_bits, only_if_different)?)
    }

    pub(crate) fn set_flow_control(
        &self,
        who: &ControllerIdentity,
        flow_control: FlowControl,
        only_if_different: bool,
    ) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_flow_control")?;
        Ok(self.driver.set_flow_control(flow_control, only_if_different)?)
    }

    pub(crate) fn set_settings(
        &self,
        who: &ControllerIdentity,
        settings: &SerialSettings,
        only_if_different: bool,
    ) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_settings")?;
        Ok(self.driver.set_settings(settings, only_if_different)?)
    }

    pub(crate) fn flush(&self, who: &ControllerIdentity) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "flush")?;
        Ok(self.driver.flush()?)
    }

    pub(crate) fn flush_input(&self, who: &ControllerIdentity) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "flush_input")?;
        Ok(self.driver.flush_input()?)
    }

    pub(crate) fn flush_output(&self, who: &ControllerIdentity) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "flush_output")?;
        Ok(self.driver.flush_output()?)
    }

    pub(crate) fn send_break(&self, who: &ControllerIdentity, duration: Duration) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "send_break")?;
        Ok(self.driver.send_break(duration)?)
    }

    pub(crate) fn set_break(&self, who: &ControllerIdentity, level: bool) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_break")?;
        Ok(self.driver.set_break(level)?)
    }

    pub(crate) fn set_rts(&self, who: &ControllerIdentity, level: bool) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_rts")?;
        Ok(self.driver.set_rts(level)?)
    }

    pub(crate) fn set_dtr(&self, who: &ControllerIdentity, level: bool) -> Result<()> {
        let _guard = AccessGuard::enter(self, who, "set_dtr")?;
        Ok(self.driver.set_dtr(level)?)
    }

    pub(crate) fn wait_for_change(&self, who: &ControllerIdentity) -> Result<bool> {
        let _guard = AccessGuard::enter(self, who, "wait_for_change")?;
        Ok(self.driver.wait_for_change()?)
    }

    pub(crate) fn read_cts(&self, who: &ControllerIdentity) -> Result<bool> {
        let _guard = AccessGuard::enter(self, who, "get_cts")?;
        Ok(self.driver.read_cts()?)
    }

    pub(crate) fn read_dsr(&self, who: &ControllerIdentity) -> Result<bool> {
        let _guard = AccessGuard::enter(self, who, "get_dsr")?;
        Ok(self.driver.read_dsr()?)
    }

    pub(crate) fn read_ri(&self, who: &ControllerIdentity) -> Result<bool> {
        let _guard = AccessGuard::enter(self, who, "get_ri")?;
        Ok(self.driver.read_ri()?)
    }

    pub(crate) fn read_cd(&self, who: &ControllerIdentity) -> Result<bool> {
        let _guard = AccessGuard::enter(self, who, "get_cd")?;
        Ok(self.driver.read_cd()?)
    }
}

impl std::fmt::Debug for AccessMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessMediator")
            .field("device_name", &self.device_name)
            .field("active_id", &self.active_id.load(Ordering::SeqCst))
            .field("current_id", &self.current_id.load(Ordering::SeqCst))
            .finish()
    }
}

/// Queues and serializes transitions. Only one ticket is live at a time;
/// later requests park in the constructor until their number comes up.
struct TransitionTicket<'m> {
    mediator: &'m AccessMediator,
}

impl<'m> TransitionTicket<'m> {
    fn acquire(mediator: &'m AccessMediator) -> Self {
        let mut queue = mediator.queue.lock();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        while queue.ready_ticket != ticket {
            mediator.queue_cond.wait(&mut queue);
        }
        drop(queue);

        let mut state = mediator.state.lock();
        state.transition_in_progress = true;
        mediator
            .concurrent_change_allowed
            .store(false, Ordering::SeqCst);
        state.transition_thread = Some(thread::current().id());
        drop(state);

        trace!(ticket, device = %mediator.device_name, "transition started");
        Self { mediator }
    }
}

impl Drop for TransitionTicket<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.mediator.state.lock();
            state.transition_in_progress = false;
        }
        self.mediator.access_unblocked_cond.notify_all();

        {
            let mut queue = self.mediator.queue.lock();
            queue.ready_ticket += 1;
        }
        self.mediator.queue_cond.notify_all();
        trace!(device = %self.mediator.device_name, "transition terminated");
    }
}

/// Reopens the gate on every exit path of a transition body.
struct AccessUnblocker<'m> {
    mediator: &'m AccessMediator,
}

impl<'m> AccessUnblocker<'m> {
    fn new(mediator: &'m AccessMediator) -> Self {
        Self { mediator }
    }
}

impl Drop for AccessUnblocker<'_> {
    fn drop(&mut self) {
        let mut state = self.mediator.state.lock();
        if !state.access_unblocked {
            state.access_unblocked = true;
            drop(state);
            self.mediator.access_unblocked_cond.notify_all();
        }
    }
}

/// Monitors one access call: waits out the gate, checks the caller is the
/// active controller, and balances the unreturned-call counter.
struct AccessGuard<'m> {
    mediator: &'m AccessMediator,
}

impl<'m> AccessGuard<'m> {
    fn enter(
        mediator: &'m AccessMediator,
        who: &ControllerIdentity,
        operation: &'static str,
    ) -> Result<Self> {
        let me = thread::current().id();
        let mut state = mediator.state.lock();
        // The gate only applies during a transition, and never to the
        // transition thread itself.
        mediator.access_unblocked_cond.wait_while(&mut state, |s| {
            s.transition_in_progress && s.transition_thread != Some(me) && !s.access_unblocked
        });
        mediator.ensure_active_locked(&state, who, operation)?;
        state.unreturned_calls += 1;
        Ok(Self { mediator })
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.mediator.state.lock();
        state.unreturned_calls -= 1;
        let drained = state.unreturned_calls == 0;
        drop(state);
        if drained {
            // The notification only means the counter touched zero; keeping
            // it there requires the gate to be shut.
            self.mediator.all_returned_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{make_active, ControllerCore};
    use crate::driver::MockDriver;
    use crate::port::Port;

    struct Probe {
        core: ControllerCore,
    }

    impl Probe {
        fn new(port: &Port) -> Arc<Self> {
            Arc::new(Self {
                core: ControllerCore::new(port, "probe", Vec::new()).unwrap(),
            })
        }
    }

    impl Controller for Probe {
        fn core(&self) -> &ControllerCore {
            &self.core
        }
    }

    fn mock_port(name: &str) -> (MockDriver, Port) {
        let mock = MockDriver::new(name);
        (mock.clone(), Port::with_driver(name, mock))
    }

    #[test]
    fn test_fresh_device_has_no_controllers() {
        let (_mock, port) = mock_port("MOCK-IDLE");
        let probe = Probe::new(&port);
        assert!(!probe.core.is_active());
        assert_eq!(port.current_controller_id(), None);
    }

    #[test]
    fn test_access_requires_active_controller() {
        let (_mock, port) = mock_port("MOCK-GATE");
        let probe = Probe::new(&port);
        let err = probe.core.open().unwrap_err();
        assert!(matches!(err, Error::NotActiveController { .. }));
    }

    #[test]
    fn test_role_noops() {
        let (_mock, port) = mock_port("MOCK-NOOP");
        let probe = Probe::new(&port);
        // Inactive controllers may request inactivity and removal freely.
        probe.core.make_inactive().unwrap();
        probe.core.remove_from_access().unwrap();

        make_active(probe.clone()).unwrap();
        assert!(probe.core.is_active());
        // Redundant activation is a no-op.
        make_active(probe.clone()).unwrap();
        assert!(probe.core.is_active());
        probe.core.remove_from_access().unwrap();
        assert!(!probe.core.is_active());
    }

    #[test]
    fn test_transition_utilities_rejected_outside_transition() {
        let (_mock, port) = mock_port("MOCK-UTIL");
        let probe = Probe::new(&port);
        make_active(probe.clone()).unwrap();

        assert!(matches!(
            probe.core.block_access_calls(),
            Err(Error::Logic(_))
        ));
        assert!(matches!(
            probe.core.unblock_access_calls(),
            Err(Error::Logic(_))
        ));
        assert!(matches!(
            probe
                .core
                .wait_for_all_access_calls_to_return(Duration::from_millis(10)),
            Err(Error::Logic(_))
        ));
    }

    #[test]
    fn test_io_round_trip_through_mediator() {
        let (mock, port) = mock_port("MOCK-IO");
        let probe = Probe::new(&port);
        make_active(probe.clone()).unwrap();

        probe.core.open().unwrap();
        assert!(probe.core.is_open().unwrap());
        mock.enqueue_read(b"pong");
        let mut buf = [0u8; 4];
        assert_eq!(probe.core.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"pong");
        probe.core.write(b"ping").unwrap();
        assert_eq!(mock.write_log(), vec![b"ping".to_vec()]);
    }
}
