//! Leor-Link: link-session protocol engine for the Leor wearable.
//!
//! This crate keeps one logical BLE session to the device, turns its
//! fragmented status notifications into settings updates, and streams
//! firmware images over the OTA service under credit-based flow control.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: GATT identities, OTA opcodes, text commands
//! - **Transport**: Link abstraction over logical channels (mock included)
//! - **Status**: Fragment reassembly, structured sync records, legacy lines
//! - **Flow**: Credit gate pacing unacknowledged packets
//! - **OTA**: Request / stream / finalize transfer engine
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Connect/disconnect lifecycle and notification dispatch
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use leor_link::{LinkConfig, LinkSession, MockTransport, SettingsStore};
//!
//! let store = Arc::new(SettingsStore::new());
//! let link = LinkSession::new(MockTransport::new(), LinkConfig::default(), store);
//! link.connect().expect("connect failed");
//!
//! let firmware = std::fs::read("firmware.bin").expect("read failed");
//! link.update_firmware(&firmware, |pct, msg| println!("{pct:>3}% {msg}"))
//!     .expect("update failed");
//! ```

pub mod config;
pub mod events;
pub mod flow;
pub mod ota;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod status;
pub mod transport;

// Re-exports for convenience
pub use config::{LinkConfig, OtaConfig};
pub use events::{LinkEvent, LinkObserver, LinkState, LogLevel, NullObserver, OtaPhase, TracingObserver};
pub use flow::{AbortReason, CreditGate, FlowError};
pub use ota::{OtaError, OtaReport, OtaStep};
pub use protocol::{Command, ControlCode};
pub use session::{LinkError, LinkSession, Session};
pub use settings::{GestureMapping, SettingsPatch, SettingsSink, SettingsSnapshot, SettingsStore};
pub use status::{ParseOutcome, StatusParser};
pub use transport::{Channel, LinkTransport, MockTransport, PeerScript, TransportError};
