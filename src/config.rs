// Wire constants and tunables for the remote debugging protocol.

use std::time::Duration;

/// Start-of-frame sentinel. The device never emits this byte outside of a frame.
pub(crate) const FRAME_START: u8 = 0xBF;
/// End-of-frame sentinel.
pub(crate) const FRAME_END: u8 = b']';

/// Upper bound on the [`crate::framing::PendingBuffer`].
pub(crate) const PENDING_BUFFER_CAP: usize = 30;

/// Upper bound on a single frame body while scanning. A device that never sends `]` has its
/// partial body flushed to the console and scanning restarts rather than growing unbounded.
pub(crate) const FRAME_BODY_CAP: usize = 50;

/// Maximum number of cells transferred per `?M`/`?W` command.
pub(crate) const MAX_CELLS_PER_COMMAND: usize = 10;

/// Sleep issued by the frame reader between polls on a zero-byte read.
pub(crate) const FRAME_POLL_SLEEP: Duration = Duration::from_millis(50);

/// Sleep issued by the host after sending the handshake token, before polling for sync.
pub(crate) const HANDSHAKE_SETTLE_SLEEP: Duration = Duration::from_millis(10);
/// Sleep between handshake sync-poll iterations.
pub(crate) const HANDSHAKE_POLL_SLEEP: Duration = Duration::from_millis(10);
/// Sleep after seeing the start sentinel, to give `]` time to arrive.
pub(crate) const HANDSHAKE_TERMINATOR_SLEEP: Duration = Duration::from_millis(20);
/// Number of sync-poll iterations attempted per handshake round.
pub(crate) const HANDSHAKE_POLL_ITERATIONS: usize = 4;

/// Connect deadline for `open_tcp`.
pub(crate) const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Inter-character read timeout for serial links (approximates `VTIME=1`).
pub(crate) const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Baud rates the serial transport accepts; anything else fails `open_serial`.
pub(crate) const ACCEPTED_BAUD_RATES: &[u32] = &[
    9600, 19200, 38400, 57600, 115200, 230400, 576000, 1152000,
];

/// ACK byte prefixing a fresh file-transfer block.
pub(crate) const ACK: u8 = 0x06;
/// NAK byte prefixing a retransmitted file-transfer block.
pub(crate) const NAK: u8 = 0x15;
