//! Transport abstraction shared by the serial and TCP links.

use crate::EngineResult;
use std::fmt;
use std::time::Duration;

pub(crate) mod serial;
pub(crate) mod tcp;

pub(crate) use serial::SerialLink;
pub(crate) use tcp::TcpLink;

/// Which transport is currently active. Exactly one is ever live at a time; see
/// [`crate::engine::Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TransportKind {
    /// No transport open; the engine facade is a no-op (except `transfer`).
    None,
    /// RS-232 serial link.
    Serial,
    /// TCP link.
    Tcp,
    /// Reserved for a future USB transport. Never produced by this crate.
    Usb,
}

/// The byte-level capability every transport exposes to the protocol layer above.
///
/// The protocol layer (`framing`, `engine`) is written once against this trait; the concrete
/// `Serial`/`Tcp` variant is matched only when a transport is opened or closed (see
/// [`crate::engine::Engine::open_serial`]/[`crate::engine::Engine::close`]).
pub(crate) trait LinkTransport: fmt::Debug + Send {
    /// Writes all of `bytes`. Returns the number of bytes written, or an error/short write.
    fn write(&mut self, bytes: &[u8]) -> EngineResult<usize>;

    /// Reads up to `buf.len()` bytes. `Ok(0)` means "no data within the transport's internal
    /// timeout" for serial, or "orderly close" for TCP.
    fn read(&mut self, buf: &mut [u8]) -> EngineResult<usize>;

    /// Cooperative pause used while polling for a frame.
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Restores prior link attributes (serial) or closes the handle (TCP). Idempotent.
    fn close(&mut self) -> EngineResult<()>;
}
