//! GATT identities and protocol constants shared with the device firmware.

use uuid::{Uuid, uuid};

/// Advertised device name.
pub const DEVICE_NAME: &str = "Leor";

// Main service
pub const SERVICE_UUID: Uuid = uuid!("4fafc201-1fb5-459e-8fcc-c5c9c331914b");
pub const COMMAND_CHAR_UUID: Uuid = uuid!("beb5483e-36e1-4688-b7f5-ea07361b26a8");
pub const STATUS_CHAR_UUID: Uuid = uuid!("1c95d5e3-d8f7-413a-bf3d-7a2e5d7be87e");
pub const GESTURE_CHAR_UUID: Uuid = uuid!("d1e5f0a1-2b3c-4d5e-6f7a-8b9c0d1e2f3a");

// OTA service
pub const OTA_SERVICE_UUID: Uuid = uuid!("d6f1d96d-594c-4c53-b1c6-244a1dfde6d8");
pub const OTA_CONTROL_UUID: Uuid = uuid!("7ad671aa-21c0-46a4-b722-270e3ae3d830");
pub const OTA_DATA_UUID: Uuid = uuid!("23408888-1f40-4cd8-9b89-ca8d45f8a5b0");

/// Largest ATT payload the link negotiates.
pub const TRANSPORT_UNIT: usize = 512;
/// ATT write header (opcode + handle).
pub const ATT_HEADER_SIZE: usize = 3;
/// Firmware bytes per data packet.
pub const OTA_PACKET_SIZE: usize = TRANSPORT_UNIT - ATT_HEADER_SIZE;

/// Packets granted per CREDIT notification. Must match the firmware's
/// `OTA_CREDIT_BATCH`; it is not negotiated.
pub const OTA_CREDIT_BATCH: u32 = 32;

/// Consecutive credit timeouts tolerated before the peer is declared dead.
pub const CREDIT_TIMEOUT_CEILING: u32 = 3;

// Timing defaults
pub const REQUEST_ACK_TIMEOUT_SECS: u64 = 10;
pub const DONE_ACK_TIMEOUT_SECS: u64 = 30;
pub const CREDIT_WAIT_MS: u64 = 5_000;
pub const REQUEST_SETTLE_MS: u64 = 100;
/// Lets the last packets reach flash before the peer validates the image.
pub const FINALIZE_SETTLE_MS: u64 = 500;
/// Pause between connecting (or between legacy queries) and the next sync write.
pub const SYNC_DELAY_MS: u64 = 300;

/// Progress is reported every this many packets (and on the last one).
pub const PROGRESS_INTERVAL: usize = 8;

/// Progress window reserved for streaming, in percent.
pub const PROGRESS_STREAM_START: u8 = 2;
pub const PROGRESS_STREAM_END: u8 = 95;

// Structured payload markers
pub const STRUCTURED_OPEN: u8 = b'{';
pub const STRUCTURED_CLOSE: u8 = b'}';
pub const GESTURE_LIST_MARKER: &[u8] = br#"[{"n":"#;
/// Largest structured payload held while waiting for its close marker.
pub const MAX_STATUS_BUFFER: usize = 4096;

/// Discriminator value of a synchronization record.
pub const SYNC_RECORD_TYPE: &str = "sync";

/// Status line published after a structured sync is applied.
pub const SYNC_COMPLETE_STATUS: &str = "Sync complete";
