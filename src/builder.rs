//! Type-state builder for [`Engine`], mirroring the teacher crate's connection-mode builder.

use crate::engine::Engine;
use crate::EngineResult;
use std::marker::PhantomData;

const DEFAULT_BAUD: u32 = 57600;

/// Builder type-states.
pub struct Init;
pub struct Serial;
pub struct Tcp;

/// Type-state builder that picks exactly one transport before `build()` becomes available.
pub struct EngineBuilder<T> {
    port: Option<String>,
    baud: u32,
    host: Option<String>,
    tcp_port: Option<u16>,
    _marker: PhantomData<T>,
}

impl Default for EngineBuilder<Init> {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder<Init> {
    pub fn new() -> Self {
        Self {
            port: None,
            baud: DEFAULT_BAUD,
            host: None,
            tcp_port: None,
            _marker: PhantomData,
        }
    }

    /// Continues toward building over a serial (RS-232) link.
    pub fn with_serial(self, port: &str) -> EngineBuilder<Serial> {
        EngineBuilder {
            port: Some(port.into()),
            baud: self.baud,
            host: None,
            tcp_port: None,
            _marker: PhantomData,
        }
    }

    /// Continues toward building over a TCP link.
    pub fn with_tcp(self, host: &str, port: u16) -> EngineBuilder<Tcp> {
        EngineBuilder {
            port: None,
            baud: self.baud,
            host: Some(host.into()),
            tcp_port: Some(port),
            _marker: PhantomData,
        }
    }
}

impl EngineBuilder<Serial> {
    /// Overrides the default baud rate (57600).
    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Opens the serial link and performs the handshake.
    pub fn build(self) -> EngineResult<Engine> {
        let mut engine = Engine::new();
        engine.open_serial(
            self.port.as_deref().expect("serial port set by with_serial"),
            self.baud,
        )?;
        Ok(engine)
    }
}

impl EngineBuilder<Tcp> {
    /// Connects and performs the handshake.
    pub fn build(self) -> EngineResult<Engine> {
        let mut engine = Engine::new();
        engine.open_tcp(
            self.host.as_deref().expect("host set by with_tcp"),
            self.tcp_port.expect("port set by with_tcp"),
        )?;
        Ok(engine)
    }
}
