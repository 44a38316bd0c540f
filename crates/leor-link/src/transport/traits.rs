//! Link transport abstraction.
//!
//! Defines the `LinkTransport` trait the engine drives. A platform
//! backend maps each logical [`Channel`] onto a GATT characteristic of
//! the bound peripheral; the mock backend records traffic for tests.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::constants::*;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {name}")]
    DeviceNotFound { name: String },

    #[error("Failed to open link: {0}")]
    OpenFailed(String),

    #[error("Channel {channel} not available: {message}")]
    BindFailed { channel: Channel, message: String },

    #[error("Channel {0} is not bound")]
    NotBound(Channel),

    #[error("Write failed on {channel}: {message}")]
    WriteFailed { channel: Channel, message: String },

    #[error("Subscribe failed on {channel}: {message}")]
    SubscribeFailed { channel: Channel, message: String },

    #[error("Device disconnected")]
    Disconnected,
}

/// Logical channel within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Text commands, host to device.
    Command,
    /// Status lines and structured sync records, device to host.
    Status,
    /// Gesture events, device to host.
    Gesture,
    /// OTA opcodes, both directions.
    OtaControl,
    /// OTA firmware packets, written without response.
    OtaData,
}

impl Channel {
    /// Channels a session cannot work without.
    pub const REQUIRED: [Channel; 3] = [Channel::Command, Channel::Status, Channel::Gesture];
    /// Channels bound best-effort for firmware updates.
    pub const UPDATE: [Channel; 2] = [Channel::OtaControl, Channel::OtaData];

    pub fn service_uuid(&self) -> Uuid {
        match self {
            Channel::Command | Channel::Status | Channel::Gesture => SERVICE_UUID,
            Channel::OtaControl | Channel::OtaData => OTA_SERVICE_UUID,
        }
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        match self {
            Channel::Command => COMMAND_CHAR_UUID,
            Channel::Status => STATUS_CHAR_UUID,
            Channel::Gesture => GESTURE_CHAR_UUID,
            Channel::OtaControl => OTA_CONTROL_UUID,
            Channel::OtaData => OTA_DATA_UUID,
        }
    }

    /// Whether the channel delivers notifications.
    pub fn notifies(&self) -> bool {
        matches!(self, Channel::Status | Channel::Gesture | Channel::OtaControl)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Command => write!(f, "command"),
            Channel::Status => write!(f, "status"),
            Channel::Gesture => write!(f, "gesture"),
            Channel::OtaControl => write!(f, "ota-control"),
            Channel::OtaData => write!(f, "ota-data"),
        }
    }
}

/// Callback invoked with each inbound notification payload.
pub type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked once when the peer drops the link.
pub type LinkLossHandler = Arc<dyn Fn() + Send + Sync>;

/// Abstract link transport.
///
/// Handlers may be invoked from a backend thread, and may also run
/// synchronously from inside `write` when the peer answers immediately;
/// callers must not hold locks across writes that a handler also takes.
pub trait LinkTransport: Send + Sync {
    /// Discover and connect to the device advertising `device_name`.
    fn open(&self, device_name: &str) -> Result<(), TransportError>;

    /// Resolve a channel on the connected device.
    fn bind(&self, channel: Channel) -> Result<(), TransportError>;

    /// Acknowledged write.
    fn write(&self, channel: Channel, data: &[u8]) -> Result<usize, TransportError>;

    /// Fire-and-forget write. Backends without a distinct mode fall back
    /// to an acknowledged write.
    fn write_without_response(
        &self,
        channel: Channel,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.write(channel, data)
    }

    /// Route notifications on `channel` to `handler`, replacing any
    /// previous subscription.
    fn subscribe(&self, channel: Channel, handler: NotifyHandler) -> Result<(), TransportError>;

    /// Stop routing notifications on `channel`.
    fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError>;

    /// Register the handler fired when the link drops without `close`.
    fn on_link_loss(&self, handler: LinkLossHandler);

    /// Tear down the link. Must not fire the link-loss handler.
    fn close(&self);

    /// Check if the link is still up.
    fn is_connected(&self) -> bool;
}
