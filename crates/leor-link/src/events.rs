//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI follow the link and firmware updates without
//! reaching into the engine's state.

use std::fmt;

use crate::protocol::ControlCode;
use crate::transport::Channel;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Link session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
        }
    }
}

/// Firmware update phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    /// REQUEST sent, waiting for the peer to open a partition.
    Requesting,
    /// Streaming packets under credit flow control.
    Transferring,
    /// DONE sent, peer validating the image.
    Finalizing,
    Succeeded,
    /// Peer refused a step or never answered it.
    Rejected,
    /// Link lost or peer stopped granting credit.
    Aborted,
}

impl fmt::Display for OtaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaPhase::Idle => write!(f, "Idle"),
            OtaPhase::Requesting => write!(f, "Requesting"),
            OtaPhase::Transferring => write!(f, "Transferring"),
            OtaPhase::Finalizing => write!(f, "Finalizing"),
            OtaPhase::Succeeded => write!(f, "Succeeded"),
            OtaPhase::Rejected => write!(f, "Rejected"),
            OtaPhase::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Events emitted by the link engine.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Link state changed.
    StateChanged { from: LinkState, to: LinkState },
    /// Session established.
    Connected { session_id: u64, ota_available: bool },
    /// Session ended; `abrupt` when the peer dropped it.
    Disconnected { session_id: u64, abrupt: bool },
    /// A structured sync record was applied.
    StatusSynced,
    /// Gesture reported by the device.
    Gesture { name: String },
    /// Opcode received on the OTA control channel.
    ControlReceived { code: ControlCode },
    /// OTA phase changed.
    OtaPhaseChanged { from: OtaPhase, to: OtaPhase },
    /// Progress update for the current transfer.
    Progress { percent: u8, current: u64, total: u64 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Packet sent or received.
    Packet {
        direction: PacketDirection,
        channel: Channel,
        length: usize,
    },
    /// Firmware update completed successfully.
    Complete,
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving link events.
///
/// Implement this trait in your UI layer to receive updates. Events may
/// arrive from the transport's notification thread.
pub trait LinkObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &LinkEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl LinkObserver for NullObserver {
    fn on_event(&self, _event: &LinkEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl LinkObserver for TracingObserver {
    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Link state changed");
            }
            LinkEvent::Connected {
                session_id,
                ota_available,
            } => {
                tracing::info!(session_id, ota_available, "Device connected");
            }
            LinkEvent::Disconnected { session_id, abrupt } => {
                if *abrupt {
                    tracing::warn!(session_id, "Device dropped the link");
                } else {
                    tracing::info!(session_id, "Device disconnected");
                }
            }
            LinkEvent::StatusSynced => tracing::info!("Status sync complete"),
            LinkEvent::Gesture { name } => tracing::debug!(gesture = %name, "Gesture"),
            LinkEvent::ControlReceived { code } => {
                tracing::debug!(code = %code, "Control code received");
            }
            LinkEvent::OtaPhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "OTA phase changed");
            }
            LinkEvent::Progress {
                percent,
                current,
                total,
            } => {
                tracing::debug!(progress = %format!("{}%", percent), current, total, "Progress");
            }
            LinkEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            LinkEvent::Packet {
                direction,
                channel,
                length,
            } => {
                tracing::trace!(dir = %direction, channel = %channel, len = length, "Packet");
            }
            LinkEvent::Complete => tracing::info!("Firmware update complete"),
        }
    }
}
