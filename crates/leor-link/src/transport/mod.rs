//! Transport layer module.

pub mod mock;
pub mod traits;

pub use mock::{DoneReply, MockTransport, PeerScript, RequestReply, WriteKind};
pub use traits::{Channel, LinkLossHandler, LinkTransport, NotifyHandler, TransportError};
