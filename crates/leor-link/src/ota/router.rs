//! Routing of OTA control notifications.
//!
//! One handler sits on the control channel for the lifetime of a
//! transfer. CREDIT feeds the [`CreditGate`]; every other opcode goes to
//! the [`AckSlot`] if a step is waiting for one.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::events::{LinkEvent, LinkObserver};
use crate::flow::{AbortReason, CreditGate};
use crate::protocol::ControlCode;

/// Result of waiting on the acknowledgement slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Received(ControlCode),
    TimedOut,
    Aborted(AbortReason),
}

#[derive(Debug, Default)]
struct SlotState {
    armed: bool,
    received: Option<ControlCode>,
    aborted: Option<AbortReason>,
}

/// Single outstanding acknowledgement wait.
///
/// Arm before writing the command so a fast reply cannot be missed.
#[derive(Debug, Default)]
pub struct AckSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl AckSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn arm(&self) {
        let mut st = self.lock();
        st.armed = true;
        st.received = None;
    }

    pub fn disarm(&self) {
        let mut st = self.lock();
        st.armed = false;
        st.received = None;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// Hand a code to the waiter. Returns false if nothing was armed.
    pub fn deliver(&self, code: ControlCode) -> bool {
        let mut st = self.lock();
        if !st.armed || st.received.is_some() {
            return false;
        }
        st.received = Some(code);
        drop(st);
        self.cond.notify_all();
        true
    }

    /// Wait for the armed reply. A reply that arrived before an abort wins.
    pub fn wait(&self, timeout: Duration) -> SlotOutcome {
        let st = self.lock();
        let (mut st, _) = self
            .cond
            .wait_timeout_while(st, timeout, |s| s.received.is_none() && s.aborted.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        st.armed = false;
        if let Some(code) = st.received.take() {
            SlotOutcome::Received(code)
        } else if let Some(reason) = st.aborted {
            SlotOutcome::Aborted(reason)
        } else {
            SlotOutcome::TimedOut
        }
    }

    /// Sleep for `duration` unless the transfer is aborted first.
    pub fn pause(&self, duration: Duration) -> Result<(), AbortReason> {
        let st = self.lock();
        let (st, _) = self
            .cond
            .wait_timeout_while(st, duration, |s| s.aborted.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match st.aborted {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    pub fn abort(&self, reason: AbortReason) {
        let mut st = self.lock();
        if st.aborted.is_none() {
            st.aborted = Some(reason);
        }
        drop(st);
        self.cond.notify_all();
    }

    pub fn aborted(&self) -> Option<AbortReason> {
        self.lock().aborted
    }
}

/// Dispatch for the control channel of one transfer.
pub struct ControlRouter {
    gate: CreditGate,
    slot: AckSlot,
    observer: Arc<dyn LinkObserver>,
}

impl ControlRouter {
    pub fn new(gate: CreditGate, observer: Arc<dyn LinkObserver>) -> Self {
        Self {
            gate,
            slot: AckSlot::new(),
            observer,
        }
    }

    pub fn gate(&self) -> &CreditGate {
        &self.gate
    }

    pub fn slot(&self) -> &AckSlot {
        &self.slot
    }

    /// Handle one control notification.
    pub fn route(&self, data: &[u8]) {
        let Some(code) = ControlCode::from_bytes(data) else {
            debug!("Empty control notification");
            return;
        };
        self.observer.on_event(&LinkEvent::ControlReceived { code });
        match code {
            ControlCode::Nop => {}
            ControlCode::Credit => self.gate.grant(),
            _ => {
                if !self.slot.deliver(code) {
                    debug!(code = %code, "Control code with no waiter, dropped");
                }
            }
        }
    }

    /// Stop every wait of this transfer.
    pub fn abort(&self, reason: AbortReason) {
        self.gate.abort(reason);
        self.slot.abort(reason);
    }
}
