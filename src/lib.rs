//! Wire protocol engine and transport abstraction for the Pawn AMX remote debugger.
//!
//! This crate speaks the host side of the AMX remote-debug link: the `0xBF ... ]` frame format,
//! the ASCII-hex command grammar (`?R`, `?M`, `?W`, `?T`, `?P`, `?U`), and the ACK/NAK
//! checksum-windowed file transfer, over either a serial (RS-232) or TCP transport. It does not
//! provide a debugger UI; callers drive an [`Engine`] and own an [`AbstractMachineView`] as the
//! host-side shadow of the device's registers and memory.
//!
//! # Example
//! ```no_run
//! # fn example() -> amx_remotedbg::EngineResult<()> {
//! use amx_remotedbg::{AbstractMachineView, EngineBuilder};
//!
//! let mut engine = EngineBuilder::new().with_serial("/dev/ttyUSB0").baud(57600).build()?;
//! let mut amx = AbstractMachineView::new(4096);
//! engine.wait(&mut amx, 100)?;
//! engine.sync(&mut amx)?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

mod amx;
mod builder;
mod checksum;
mod config;
mod engine;
mod framing;
mod transport;

pub use amx::{AbstractMachineView, Cell};
pub use builder::EngineBuilder;
pub use engine::Engine;
pub use transport::TransportKind;

/// Errors surfaced by transport setup, framing, and the protocol engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Opening the underlying serial port or TCP socket failed.
    #[error("failed to open transport: {0}")]
    TransportOpen(String),
    /// A read or write on an already-open transport failed.
    #[error("transport i/o error: {0}")]
    TransportIo(String),
    /// No frame arrived before the retry budget was exhausted.
    #[error("timed out waiting for a framed reply")]
    FramingTimeout,
    /// The device's reply did not match the expected command grammar.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The device rejected a file transfer outright (status `0`).
    #[error("device rejected the file transfer")]
    TransferRejected,
}

/// Result alias used throughout this crate.
pub type EngineResult<T> = std::result::Result<T, Error>;
