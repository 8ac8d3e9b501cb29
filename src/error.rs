//! Crate-wide error type shared by every protocol driver.

use thiserror::Error;

/// Errors surfaced by the serial transport and the protocol layers built on it.
///
/// Recoverability follows the policy in the error handling design: most
/// variants are recoverable at the call site (the I/O engine retries
/// [`Error::Timeout`] and [`Error::IntegrityFailure`] on its own), a few are
/// fatal for the current session ([`Error::TransportClosed`]), and a few are
/// simply reported back to the caller ([`Error::AuthenticationDenied`],
/// [`Error::Denied`], [`Error::Unsupported`]).
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The serial port closed while an operation was pending.
    #[error("transport closed")]
    TransportClosed,

    /// No expected byte/line arrived within the configured window.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Frame type, length, start/end token, or opcode did not match
    /// what the protocol requires. Never retried silently.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Header XOR, CRC, or XOR checksum mismatch. Triggers adaptive retry.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// BFC authentication was rejected by the remote endpoint.
    #[error("authentication denied")]
    AuthenticationDenied,

    /// BSL rejected the uploaded payload (ack byte 0x1B/0x1C).
    #[error("denied (ack byte {0:#04x})")]
    Denied(u8),

    /// Caller-supplied address/length violates the protocol's alignment.
    #[error("alignment: {0}")]
    Alignment(String),

    /// The operation was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    /// A feature or configuration the protocol cannot speak, e.g. BFC
    /// over Bluetooth, an unknown display format, or a missing keyset.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A response value fell outside the set of values the caller expected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type SieResult<T> = std::result::Result<T, Error>;
