//! Text commands accepted on the command characteristic.
//!
//! The device splits a payload on newlines and semicolons, so a single
//! write may carry several commands.

use std::fmt;

/// Appearance keys settable with `set:<key>=<value>`.
pub const APPEARANCE_KEYS: [&str; 11] = [
    "ew", "eh", "es", "er", "mw", "lt", "vt", "bi", "gs", "os", "ss",
];

/// A command understood by the device firmware.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Unified status sync; answered with one structured sync record.
    Sync,
    /// Legacy shuffle status query.
    ShuffleStatus,
    /// Legacy appearance settings query.
    AppearanceStatus,
    /// Legacy gesture settings query.
    GestureStatus,
    /// Gesture mapping list query.
    GestureInfo,
    /// Legacy BLE power status query.
    PowerStatus,
    /// Legacy breathing status query.
    BreathingStatus,
    /// Set an appearance parameter.
    Set { key: String, value: f64 },
    /// Switch the link between low-power and high-power transmission.
    LowPower(bool),
    /// Enable or disable on-device gesture matching.
    GestureMatch(bool),
    /// Any other token (expressions, gaze directions, ...).
    Raw(String),
}

impl Command {
    /// The per-topic queries older firmware answers with legacy lines.
    pub const LEGACY_SYNC: [Command; 6] = [
        Command::ShuffleStatus,
        Command::AppearanceStatus,
        Command::GestureStatus,
        Command::GestureInfo,
        Command::PowerStatus,
        Command::BreathingStatus,
    ];

    /// Check that a `Set` targets a known appearance key.
    pub fn is_valid(&self) -> bool {
        match self {
            Command::Set { key, value } => {
                APPEARANCE_KEYS.contains(&key.as_str()) && value.is_finite()
            }
            Command::Raw(token) => !token.trim().is_empty(),
            _ => true,
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Sync => write!(f, "sync"),
            Command::ShuffleStatus => write!(f, "sh:"),
            Command::AppearanceStatus => write!(f, "s:"),
            Command::GestureStatus => write!(f, "gs:"),
            Command::GestureInfo => write!(f, "gi"),
            Command::PowerStatus => write!(f, "ble:"),
            Command::BreathingStatus => write!(f, "br:"),
            Command::Set { key, value } => write!(f, "set:{}={}", key, value),
            Command::LowPower(on) => write!(f, "ble:lp={}", u8::from(*on)),
            Command::GestureMatch(on) => write!(f, "gesture:match={}", u8::from(*on)),
            Command::Raw(token) => write!(f, "{}", token.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tokens() {
        assert_eq!(Command::Sync.to_string(), "sync");
        assert_eq!(Command::LowPower(false).to_string(), "ble:lp=0");
        assert_eq!(Command::LowPower(true).to_string(), "ble:lp=1");
        assert_eq!(Command::GestureMatch(true).to_string(), "gesture:match=1");
        assert_eq!(
            Command::Set {
                key: "ew".into(),
                value: 40.0
            }
            .to_string(),
            "set:ew=40"
        );
        assert_eq!(Command::Raw(" blink ".into()).to_wire(), b"blink");
    }

    #[test]
    fn test_legacy_sync_order() {
        let tokens: Vec<String> = Command::LEGACY_SYNC.iter().map(|c| c.to_string()).collect();
        assert_eq!(tokens, ["sh:", "s:", "gs:", "gi", "ble:", "br:"]);
    }

    #[test]
    fn test_validation() {
        assert!(
            Command::Set {
                key: "mw".into(),
                value: 20.5
            }
            .is_valid()
        );
        assert!(
            !Command::Set {
                key: "zz".into(),
                value: 1.0
            }
            .is_valid()
        );
        assert!(
            !Command::Set {
                key: "ew".into(),
                value: f64::NAN
            }
            .is_valid()
        );
        assert!(!Command::Raw("  ".into()).is_valid());
    }
}
