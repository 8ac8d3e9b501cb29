//! DWD: binary debug protocol tunneled over AT-like envelopes.

pub mod frame;
pub mod handshake;
pub mod memory;

pub use frame::{DwdOpcode, encapsulate, decapsulate};
pub use handshake::{KeySet, named_keyset, connect};
