//! Firmware update transfer.
//!
//! ```text
//! Idle -> Requesting -> Transferring -> Finalizing -> Succeeded
//!             |              |              |
//!             +--------------+--------------+-> Rejected | Aborted
//! ```
//!
//! REQUEST and DONE are acknowledged on the control channel; packets in
//! between are written without response and paced by credit.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::packets::PacketCursor;
use super::router::{ControlRouter, SlotOutcome};
use crate::config::OtaConfig;
use crate::events::{LinkEvent, LinkObserver, LogLevel, OtaPhase};
use crate::flow::{AbortReason, CreditGate, FlowError};
use crate::protocol::constants::{OTA_PACKET_SIZE, PROGRESS_STREAM_END, PROGRESS_STREAM_START};
use crate::protocol::{Command, ControlCode};
use crate::session::Session;
use crate::settings::SettingsSink;
use crate::transport::{Channel, LinkTransport, TransportError};

/// Acknowledged protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStep {
    Request,
    Done,
}

impl fmt::Display for OtaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaStep::Request => write!(f, "update request"),
            OtaStep::Done => write!(f, "firmware image"),
        }
    }
}

fn describe_reply(code: &Option<ControlCode>) -> String {
    match code {
        Some(code) => format!("replied {}", code),
        None => "no reply".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("OTA service not available on this device")]
    Unavailable,

    #[error("A firmware update is already in progress")]
    Busy,

    #[error("Firmware image is empty")]
    EmptyFirmware,

    #[error("Not connected")]
    NotConnected,

    #[error("Device rejected the {step} ({})", describe_reply(.code))]
    Rejected {
        step: OtaStep,
        code: Option<ControlCode>,
    },

    #[error("Device stopped granting credit after {timeouts} timeouts")]
    PeerUnresponsive { timeouts: u32 },

    #[error("Device disconnected during update")]
    Disconnected,

    #[error("Update cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl OtaError {
    /// Terminal phase this error leaves the transfer in.
    pub fn phase(&self) -> OtaPhase {
        match self {
            OtaError::Rejected { .. } => OtaPhase::Rejected,
            _ => OtaPhase::Aborted,
        }
    }
}

impl From<AbortReason> for OtaError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Disconnected => OtaError::Disconnected,
            AbortReason::Cancelled => OtaError::Cancelled,
        }
    }
}

impl From<FlowError> for OtaError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Disconnected => OtaError::Disconnected,
            FlowError::Cancelled => OtaError::Cancelled,
            FlowError::PeerUnresponsive { timeouts } => OtaError::PeerUnresponsive { timeouts },
        }
    }
}

/// Summary of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaReport {
    pub packets: usize,
    pub bytes: usize,
    /// Free credit batches issued after lost grants.
    pub over_grants: u32,
    pub elapsed: Duration,
}

/// Unsubscribes the control channel when the transfer ends.
struct ControlCleanup<'a, T: LinkTransport> {
    transport: &'a T,
    router: Arc<ControlRouter>,
}

impl<T: LinkTransport> Drop for ControlCleanup<'_, T> {
    fn drop(&mut self) {
        self.router.slot().disarm();
        if let Err(e) = self.transport.unsubscribe(Channel::OtaControl) {
            debug!(error = %e, "Control unsubscribe failed");
        }
    }
}

/// One firmware transfer. Consumed by [`OtaEngine::run`].
pub struct OtaEngine<'a, T: LinkTransport> {
    transport: &'a T,
    session: Arc<Session>,
    sink: &'a dyn SettingsSink,
    observer: Arc<dyn LinkObserver>,
    config: &'a OtaConfig,
    router: Arc<ControlRouter>,
    phase: OtaPhase,
}

impl<'a, T: LinkTransport> OtaEngine<'a, T> {
    pub fn new(
        transport: &'a T,
        session: Arc<Session>,
        sink: &'a dyn SettingsSink,
        observer: Arc<dyn LinkObserver>,
        config: &'a OtaConfig,
    ) -> Self {
        let gate = CreditGate::seeded(
            config.credit_batch,
            config.credit_timeout(),
            config.credit_timeout_ceiling,
        );
        let router = Arc::new(ControlRouter::new(gate, observer.clone()));
        Self {
            transport,
            session,
            sink,
            observer,
            config,
            router,
            phase: OtaPhase::Idle,
        }
    }

    /// Handle used to abort this transfer from another thread.
    pub fn router(&self) -> Arc<ControlRouter> {
        self.router.clone()
    }

    pub fn phase(&self) -> OtaPhase {
        self.phase
    }

    fn set_phase(&mut self, to: OtaPhase) {
        if self.phase != to {
            let from = self.phase;
            self.phase = to;
            self.observer.on_event(&LinkEvent::OtaPhaseChanged { from, to });
        }
    }

    /// Run the transfer to completion.
    ///
    /// `progress` receives `(percent, message)`; every failure ends with
    /// one call at 0%.
    #[instrument(skip_all, fields(session = self.session.id(), size = firmware.len()))]
    pub fn run(
        mut self,
        firmware: &[u8],
        progress: &mut dyn FnMut(u8, &str),
    ) -> Result<OtaReport, OtaError> {
        if let Err(e) = self.preflight(firmware) {
            warn!(error = %e, "Firmware update not started");
            progress(0, &e.to_string());
            return Err(e);
        }

        let result = self.execute(firmware, progress);
        match &result {
            Ok(report) => {
                self.set_phase(OtaPhase::Succeeded);
                info!(
                    packets = report.packets,
                    over_grants = report.over_grants,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Firmware update complete"
                );
                self.observer.on_event(&LinkEvent::Complete);
                progress(100, "Update complete, device is restarting");
            }
            Err(e) => {
                self.set_phase(e.phase());
                let message = format!("Update failed: {}", e);
                warn!(error = %e, "Firmware update failed");
                self.observer.on_event(&LinkEvent::Log {
                    level: LogLevel::Error,
                    message: message.clone(),
                });
                progress(0, &message);
            }
        }
        result
    }

    fn preflight(&self, firmware: &[u8]) -> Result<(), OtaError> {
        if !self.session.is_connected() {
            return Err(OtaError::NotConnected);
        }
        if !self.session.has_update_channels() {
            return Err(OtaError::Unavailable);
        }
        if firmware.is_empty() {
            return Err(OtaError::EmptyFirmware);
        }
        Ok(())
    }

    fn execute(
        &mut self,
        firmware: &[u8],
        progress: &mut dyn FnMut(u8, &str),
    ) -> Result<OtaReport, OtaError> {
        let started = Instant::now();

        // Low-power mode throttles the link too hard for streaming.
        let boosted = self.sink.snapshot().low_power;
        if boosted {
            info!("Leaving low-power mode for the transfer");
            self.write(Channel::Command, &Command::LowPower(false).to_wire())?;
        }

        let result = self.transfer(firmware, progress, started);

        if boosted {
            if self.session.is_connected() {
                if let Err(e) = self.transport.write(Channel::Command, &Command::LowPower(true).to_wire()) {
                    warn!(error = %e, "Failed to restore low-power mode");
                }
            } else {
                debug!("Session gone, low-power mode not restored");
            }
        }
        result
    }

    fn transfer(
        &mut self,
        firmware: &[u8],
        progress: &mut dyn FnMut(u8, &str),
        started: Instant,
    ) -> Result<OtaReport, OtaError> {
        let _cleanup = ControlCleanup {
            transport: self.transport,
            router: self.router.clone(),
        };
        let router = self.router.clone();
        self.transport
            .subscribe(Channel::OtaControl, Arc::new(move |data: &[u8]| router.route(data)))
            .map_err(|e| self.transport_error(e))?;
        let router = self.router.clone();
        let _hook = self
            .session
            .add_loss_hook(Arc::new(move || router.abort(AbortReason::Disconnected)));

        // Requesting
        self.set_phase(OtaPhase::Requesting);
        progress(1, "Requesting update");
        let mut announce = [0u8; 2];
        LittleEndian::write_u16(&mut announce, OTA_PACKET_SIZE as u16);
        self.write(Channel::OtaData, &announce)?;

        self.router.slot().arm();
        self.write(Channel::OtaControl, &[ControlCode::Request.as_byte()])?;
        self.await_ack(OtaStep::Request, ControlCode::RequestAck, self.config.request_timeout())?;
        self.router.slot().pause(self.config.request_settle())?;

        // Transferring
        self.set_phase(OtaPhase::Transferring);
        progress(PROGRESS_STREAM_START, "Transferring firmware");
        let mut cursor = PacketCursor::new(firmware.len(), OTA_PACKET_SIZE);
        info!(packets = cursor.total, bytes = firmware.len(), "Streaming firmware");
        while let Some(packet) = cursor.next_packet(firmware) {
            self.router.gate().consume()?;
            self.transport
                .write_without_response(Channel::OtaData, packet)
                .map_err(|e| self.transport_error(e))?;
            if cursor.should_report(self.config.progress_interval) {
                let percent = cursor.progress_pct();
                self.observer.on_event(&LinkEvent::Progress {
                    percent,
                    current: cursor.offset as u64,
                    total: firmware.len() as u64,
                });
                progress(percent, &format!("Sent {}/{} packets", cursor.current, cursor.total));
            }
        }

        // Finalizing
        self.set_phase(OtaPhase::Finalizing);
        progress(PROGRESS_STREAM_END + 1, "Verifying firmware");
        self.router.slot().pause(self.config.finalize_settle())?;
        self.router.slot().arm();
        // The device may reboot before answering the write itself.
        if let Err(e) = self
            .transport
            .write(Channel::OtaControl, &[ControlCode::Done.as_byte()])
        {
            warn!(error = %e, "DONE write not confirmed, waiting for the device");
        }
        self.await_ack(OtaStep::Done, ControlCode::DoneAck, self.config.done_timeout())?;

        Ok(OtaReport {
            packets: cursor.current,
            bytes: cursor.offset,
            over_grants: self.router.gate().over_grants(),
            elapsed: started.elapsed(),
        })
    }

    fn await_ack(&self, step: OtaStep, expected: ControlCode, timeout: Duration) -> Result<(), OtaError> {
        match self.router.slot().wait(timeout) {
            SlotOutcome::Received(code) if code == expected => {
                debug!(step = %step, "Acknowledged");
                Ok(())
            }
            SlotOutcome::Received(code) => Err(OtaError::Rejected {
                step,
                code: Some(code),
            }),
            SlotOutcome::TimedOut => Err(OtaError::Rejected { step, code: None }),
            SlotOutcome::Aborted(reason) => Err(reason.into()),
        }
    }

    fn write(&self, channel: Channel, data: &[u8]) -> Result<(), OtaError> {
        self.transport
            .write(channel, data)
            .map(|_| ())
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, err: TransportError) -> OtaError {
        if let Some(reason) = self.router.slot().aborted() {
            return reason.into();
        }
        if matches!(err, TransportError::Disconnected) || !self.session.is_connected() {
            return OtaError::Disconnected;
        }
        OtaError::Transport(err)
    }
}
