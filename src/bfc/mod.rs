//! BFC: multiplexed framed bus with per-destination channels, CRC, ACK,
//! authentication, and higher-level service operations.

pub mod frame;
pub mod service;
pub mod transport;

pub use frame::{BfcFrame, FrameType, Flags};
pub use transport::{BfcTransport, TransportMode};
