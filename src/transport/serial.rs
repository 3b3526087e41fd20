// RS-232 serial transport: 8N1, no hardware flow control, short inter-character read timeout.

use super::LinkTransport;
use crate::config::{ACCEPTED_BAUD_RATES, SERIAL_READ_TIMEOUT};
use crate::{EngineResult, Error};
use serial2::{CharSize, FlowControl, Parity, Settings, StopBits};
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct SerialLink {
    port: serial2::SerialPort,
}

impl SerialLink {
    /// Opens `port` at `baud`. Fails without opening the OS handle if `baud` is not in the
    /// accepted set.
    pub(crate) fn open(port: &str, baud: u32) -> EngineResult<Self> {
        if !ACCEPTED_BAUD_RATES.contains(&baud) {
            return Err(Error::TransportOpen(format!(
                "unsupported baud rate {baud}, expected one of {ACCEPTED_BAUD_RATES:?}"
            )));
        }

        let serial = serial2::SerialPort::open(port, |mut settings: Settings| {
            settings.set_raw();
            settings.set_baud_rate(baud)?;
            settings.set_char_size(CharSize::Bits8);
            settings.set_stop_bits(StopBits::One);
            settings.set_parity(Parity::None);
            settings.set_flow_control(FlowControl::None);
            Ok(settings)
        })
        .map_err(|e| Error::TransportOpen(e.to_string()))?;

        serial
            .set_read_timeout(SERIAL_READ_TIMEOUT)
            .map_err(|e| Error::TransportOpen(e.to_string()))?;

        debug!(port, baud, "serial link opened");
        Ok(Self { port: serial })
    }
}

impl LinkTransport for SerialLink {
    fn write(&mut self, bytes: &[u8]) -> EngineResult<usize> {
        self.port
            .write(bytes)
            .map_err(|e| Error::TransportIo(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // A timed-out read with zero bytes is the normal "nothing arrived yet" case.
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::TransportIo(e.to_string())),
        }
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn close(&mut self) -> EngineResult<()> {
        // serial2 restores the original termios settings when the handle drops; nothing else to
        // do here beyond making the call idempotent and observable.
        debug!("serial link closed");
        Ok(())
    }
}
