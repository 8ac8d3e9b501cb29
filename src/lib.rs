//! Serial-line protocols for legacy Siemens mobile phone service/debug
//! interfaces.
//!
//! Six protocols share one [`serial::SerialPort`]:
//! * [`at`] — the line-oriented AT command channel every other protocol
//!   either speaks directly or tunnels through.
//! * [`bfc`] — the framed, multiplexed, CRC-checked service bus BFC phones
//!   switch into from AT mode.
//! * [`cgsn`] — raw memory access layered directly on top of AT via the
//!   `AT+CGSN` command family.
//! * [`bsl`] — the boot-ROM ignition handshake that hands a phone off to a
//!   second-stage loader.
//! * [`ebl`] — the checksummed packet protocol spoken by that second-stage
//!   loader.
//! * [`dwd`] — the keyed, escaped debug protocol tunneled inside AT-like
//!   envelopes.
//! * [`chaos`] — the resident flasher BSL can hand off into, with its own
//!   heartbeat and adaptive-paging read/write loop.
//!
//! [`io_engine`] is the page-oriented, adaptively-shrinking, cancellable,
//! progress-reporting bulk I/O engine shared by every protocol's memory
//! read/write primitive. [`flash`] turns a flash region map into
//! region-aligned write chunks. [`config`] collects the baud/timeout/retry
//! defaults every protocol is built against.
//!
//! # Example
//! ```no_run
//! # async fn example(port: impl sie_serial::serial::SerialPort) -> sie_serial::error::SieResult<()> {
//! use sie_serial::bfc::BfcTransport;
//!
//! let transport = BfcTransport::new(port).connect().await?;
//! let buffer = transport.read_memory(0x01, 0x1000, 256).await?;
//! # let _ = buffer;
//! # Ok(())
//! # }
//! ```

pub mod at;
pub mod bfc;
pub mod bsl;
pub mod cgsn;
pub mod chaos;
pub mod config;
pub mod crc16;
pub mod dwd;
pub mod ebl;
pub mod error;
pub mod flash;
pub mod io_engine;
pub(crate) mod log;
pub mod serial;

pub use error::{Error, SieResult};
