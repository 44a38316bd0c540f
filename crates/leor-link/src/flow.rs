//! Credit-based flow control for firmware packets.
//!
//! Data packets go out without acknowledgement, so the peer paces the host
//! by granting credit in batches. [`CreditGate`] is a counting semaphore
//! with a bounded wait: when a grant notification goes missing the gate
//! hands out one free batch, and gives up after a fixed number of
//! consecutive silent waits.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Why an in-flight transfer was stopped from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The link went away.
    Disconnected,
    /// The caller asked to stop.
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("Link lost while waiting for credit")]
    Disconnected,

    #[error("Transfer cancelled while waiting for credit")]
    Cancelled,

    #[error("Peer granted no credit after {timeouts} consecutive waits")]
    PeerUnresponsive { timeouts: u32 },
}

impl From<AbortReason> for FlowError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Disconnected => FlowError::Disconnected,
            AbortReason::Cancelled => FlowError::Cancelled,
        }
    }
}

#[derive(Debug, Default)]
struct CreditState {
    balance: u32,
    consecutive_timeouts: u32,
    over_grants: u32,
    peer_grants: u32,
    aborted: Option<AbortReason>,
}

/// Send-credit balance shared between the packet writer and the control
/// channel handler.
#[derive(Debug)]
pub struct CreditGate {
    batch: u32,
    wait: Duration,
    ceiling: u32,
    state: Mutex<CreditState>,
    cond: Condvar,
}

impl CreditGate {
    /// Gate holding one batch so the first burst goes out immediately.
    pub fn seeded(batch: u32, wait: Duration, ceiling: u32) -> Self {
        Self {
            batch,
            wait,
            ceiling: ceiling.max(1),
            state: Mutex::new(CreditState {
                balance: batch,
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CreditState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one credit, waiting for a grant if the balance is empty.
    pub fn consume(&self) -> Result<(), FlowError> {
        let mut st = self.lock();
        loop {
            if let Some(reason) = st.aborted {
                return Err(reason.into());
            }
            if st.balance > 0 {
                st.balance -= 1;
                return Ok(());
            }

            let (guard, result) = self
                .cond
                .wait_timeout_while(st, self.wait, |s| s.balance == 0 && s.aborted.is_none())
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;

            if result.timed_out() && st.balance == 0 && st.aborted.is_none() {
                st.consecutive_timeouts += 1;
                if st.consecutive_timeouts >= self.ceiling {
                    warn!(timeouts = st.consecutive_timeouts, "Peer stopped granting credit");
                    return Err(FlowError::PeerUnresponsive {
                        timeouts: st.consecutive_timeouts,
                    });
                }
                // Grant notifications can be lost on the air.
                st.balance += self.batch;
                st.over_grants += 1;
                warn!(
                    timeouts = st.consecutive_timeouts,
                    over_grants = st.over_grants,
                    "Credit wait timed out, granting a free batch"
                );
            }
        }
    }

    /// Peer announced room for another batch.
    pub fn grant(&self) {
        let mut st = self.lock();
        st.balance += self.batch;
        st.peer_grants += 1;
        st.consecutive_timeouts = 0;
        debug!(balance = st.balance, "Credit granted");
        drop(st);
        self.cond.notify_one();
    }

    /// Fail the current and every future wait.
    pub fn abort(&self, reason: AbortReason) {
        let mut st = self.lock();
        if st.aborted.is_none() {
            st.aborted = Some(reason);
        }
        drop(st);
        self.cond.notify_all();
    }

    pub fn balance(&self) -> u32 {
        self.lock().balance
    }

    /// Free batches handed out after a timed-out wait.
    pub fn over_grants(&self) -> u32 {
        self.lock().over_grants
    }

    pub fn peer_grants(&self) -> u32 {
        self.lock().peer_grants
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }
}
