//! OTA control opcodes.
//!
//! The control characteristic carries single-byte opcodes in both
//! directions. The host writes REQUEST/DONE; the device notifies the
//! matching ACK/NAK and, during streaming, CREDIT.

use std::fmt;

/// Opcode on the OTA control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    Nop,
    Request,
    RequestAck,
    RequestNak,
    Done,
    DoneAck,
    DoneNak,
    /// Peer reserved buffer space for another batch of packets.
    Credit,
    Unknown(u8),
}

impl ControlCode {
    /// Parse the first byte of a control notification.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.first().map(|&b| Self::from_byte(b))
    }

    pub const fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::Nop,
            0x01 => Self::Request,
            0x02 => Self::RequestAck,
            0x03 => Self::RequestNak,
            0x04 => Self::Done,
            0x05 => Self::DoneAck,
            0x06 => Self::DoneNak,
            0x07 => Self::Credit,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_byte(&self) -> u8 {
        match self {
            Self::Nop => 0x00,
            Self::Request => 0x01,
            Self::RequestAck => 0x02,
            Self::RequestNak => 0x03,
            Self::Done => 0x04,
            Self::DoneAck => 0x05,
            Self::DoneNak => 0x06,
            Self::Credit => 0x07,
            Self::Unknown(b) => *b,
        }
    }

    /// Check if this is a negative acknowledgement.
    pub fn is_nak(&self) -> bool {
        matches!(self, Self::RequestNak | Self::DoneNak)
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nop => write!(f, "NOP"),
            Self::Request => write!(f, "REQUEST"),
            Self::RequestAck => write!(f, "REQUEST_ACK"),
            Self::RequestNak => write!(f, "REQUEST_NAK"),
            Self::Done => write!(f, "DONE"),
            Self::DoneAck => write!(f, "DONE_ACK"),
            Self::DoneNak => write!(f, "DONE_NAK"),
            Self::Credit => write!(f, "CREDIT"),
            Self::Unknown(b) => write!(f, "UNKNOWN(0x{:02X})", b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(ControlCode::Request.as_byte(), 1);
        assert_eq!(ControlCode::RequestAck.as_byte(), 2);
        assert_eq!(ControlCode::RequestNak.as_byte(), 3);
        assert_eq!(ControlCode::Done.as_byte(), 4);
        assert_eq!(ControlCode::DoneAck.as_byte(), 5);
        assert_eq!(ControlCode::DoneNak.as_byte(), 6);
        assert_eq!(ControlCode::Credit.as_byte(), 7);
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(ControlCode::from_bytes(&[0x07]), Some(ControlCode::Credit));
        assert_eq!(ControlCode::from_bytes(&[0x05, 0xFF]), Some(ControlCode::DoneAck));
        assert_eq!(ControlCode::from_bytes(&[]), None);
        assert_eq!(ControlCode::from_byte(0x42), ControlCode::Unknown(0x42));
    }

    #[test]
    fn test_nak_detection() {
        assert!(ControlCode::RequestNak.is_nak());
        assert!(ControlCode::DoneNak.is_nak());
        assert!(!ControlCode::DoneAck.is_nak());
        assert_eq!(ControlCode::Unknown(0x42).to_string(), "UNKNOWN(0x42)");
    }
}
