//! Firmware update over the OTA service.

pub mod engine;
pub mod packets;
pub mod router;

pub use engine::{OtaEngine, OtaError, OtaReport, OtaStep};
pub use packets::{PacketCursor, stream_percent};
pub use router::{AckSlot, ControlRouter, SlotOutcome};
