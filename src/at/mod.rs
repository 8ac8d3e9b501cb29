//! AT command channel: line-framed command/response engine.

pub mod channel;
pub mod command;

pub use channel::AtChannel;
pub use command::{AtCommand, AtCommandKind, AtResponse, AtStatus};
