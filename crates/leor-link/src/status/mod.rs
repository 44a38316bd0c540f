//! Status channel decoding.
//!
//! Newer firmware answers a sync request with one JSON record split
//! across several notifications; older firmware emits free-text lines.
//! Both are accepted without a version handshake.

pub mod legacy;
pub mod parser;
pub mod structured;

pub use legacy::LegacyGrammar;
pub use parser::{ParseOutcome, StatusBuffer, StatusParser};
pub use structured::{MappingEntry, StatusRecord, Toggle};
