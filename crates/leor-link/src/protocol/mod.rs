//! Protocol module - Leor GATT profile and OTA control definitions.

pub mod command;
pub mod constants;
pub mod opcode;

pub use command::Command;
pub use constants::*;
pub use opcode::ControlCode;
