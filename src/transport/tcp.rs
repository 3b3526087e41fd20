// TCP transport: non-blocking connect with a bounded deadline, blocking thereafter.

use super::LinkTransport;
use crate::config::TCP_CONNECT_TIMEOUT;
use crate::{EngineResult, Error};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    /// Resolves `host:port`, connects with a 5-second deadline, then restores blocking mode.
    pub(crate) fn open(host: &str, port: u16) -> EngineResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::TransportOpen(e.to_string()))?
            .next()
            .ok_or_else(|| Error::TransportOpen(format!("could not resolve {host}:{port}")))?;

        let stream = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT)
            .map_err(|e| Error::TransportOpen(e.to_string()))?;
        stream
            .set_nonblocking(false)
            .map_err(|e| Error::TransportOpen(e.to_string()))?;

        debug!(host, port, "tcp link opened");
        Ok(Self { stream })
    }
}

impl LinkTransport for TcpLink {
    fn write(&mut self, bytes: &[u8]) -> EngineResult<usize> {
        self.stream
            .write_all(bytes)
            .map(|_| bytes.len())
            .map_err(|e| Error::TransportIo(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        // Unlike serial's read timeout, TCP never legitimately returns 0 mid-conversation: a
        // blocking socket only returns `Ok(0)` on orderly close by the peer. Surface that as a
        // fatal I/O error rather than letting the framing layer retry it as "no bytes yet".
        match self.stream.read(buf) {
            Ok(0) => Err(Error::TransportIo("connection closed by peer".into())),
            Ok(n) => Ok(n),
            Err(e) => Err(Error::TransportIo(e.to_string())),
        }
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn close(&mut self) -> EngineResult<()> {
        // TcpStream::shutdown is best-effort and may legitimately fail if the peer already
        // closed the connection; this is not a caller-visible error.
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        debug!("tcp link closed");
        Ok(())
    }
}
