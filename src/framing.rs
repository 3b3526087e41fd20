//! Frame boundary detection and the inter-read pending buffer.
//!
//! The wire interleaves framed replies (`0xBF ... ]`) with free-form device `stdout`. A frame is
//! read byte-at-a-time so that bytes belonging to the *next* frame (or to trailing console
//! output) are never consumed past `]`; anything read past the boundary is stashed in a
//! [`PendingBuffer`] and drained before the next transport read.

use crate::config::{FRAME_BODY_CAP, FRAME_END, FRAME_POLL_SLEEP, FRAME_START, PENDING_BUFFER_CAP};
use crate::transport::LinkTransport;

/// Bytes read past a frame boundary, held for the next read. Bounded to
/// [`crate::config::PENDING_BUFFER_CAP`]; the invariant is enforced at every push.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct PendingBuffer {
    bytes: Vec<u8>,
}

impl PendingBuffer {
    pub(crate) fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Takes ownership of the buffered bytes, leaving the buffer empty.
    pub(crate) fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// Stores `bytes` for the next read, truncating to the bound if the caller handed over more
    /// than fits (callers are expected to have already flushed the overflow as console output).
    pub(crate) fn fill(&mut self, mut bytes: Vec<u8>) {
        if bytes.len() > PENDING_BUFFER_CAP {
            bytes.truncate(PENDING_BUFFER_CAP);
        }
        self.bytes = bytes;
    }
}

/// A fully-delimited frame body: the bytes strictly between `0xBF` and `]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) body: Vec<u8>,
}

impl Frame {
    pub(crate) fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scan,
    Start,
}

/// Reads one frame from `link`, consuming `pending` first. Bytes outside the frame (before
/// `0xBF` or, within the same read, after `]`) are handed to `console` verbatim, in the order
/// they were read. Returns `None` if `retries` is exhausted with no frame found.
///
/// A body that grows past [`FRAME_BODY_CAP`] without a terminating `]` is flushed to `console`
/// and scanning returns to looking for the next `0xBF`, so a device that never terminates a
/// frame can't grow the accumulator without bound.
///
/// `retries` is a shared budget decremented in place only on a zero-byte read (serial timeout);
/// callers that loop across multiple `read_frame` calls (e.g. `Engine::wait` re-scanning after a
/// malformed body) pass the same `&mut i64` through so the budget is spent cumulatively across
/// the whole operation rather than reset on every call. TCP links never see a zero-byte read
/// mid-frame (orderly close is surfaced by [`crate::transport::tcp::TcpLink`] as an I/O error,
/// not `Ok(0)`), so the budget is a no-op there.
pub(crate) fn read_frame(
    link: &mut dyn LinkTransport,
    pending: &mut PendingBuffer,
    retries: &mut i64,
    console: &mut dyn FnMut(&[u8]),
) -> crate::EngineResult<Option<Frame>> {
    let mut state = ScanState::Scan;
    let mut acc: Vec<u8> = Vec::new();
    let mut one_byte = [0u8; 1];

    loop {
        let chunk: Vec<u8> = if !pending.is_empty() {
            pending.take()
        } else {
            let n = link.read(&mut one_byte)?;
            if n == 0 {
                if *retries <= 0 {
                    return Ok(None);
                }
                *retries -= 1;
                link.sleep(FRAME_POLL_SLEEP);
                continue;
            }
            vec![one_byte[0]]
        };

        for (idx, byte) in chunk.iter().enumerate() {
            match state {
                ScanState::Scan => {
                    if *byte == FRAME_START {
                        state = ScanState::Start;
                    } else {
                        console(&[*byte]);
                    }
                }
                ScanState::Start => {
                    if *byte == FRAME_END {
                        let rest = &chunk[idx + 1..];
                        if !rest.is_empty() {
                            pending.fill(rest.to_vec());
                        }
                        return Ok(Some(Frame { body: acc }));
                    }
                    acc.push(*byte);
                    if acc.len() > FRAME_BODY_CAP {
                        // Never terminated within the bound; flush what we have as console
                        // output and resync on the next `0xBF` instead of growing forever.
                        console(&acc);
                        acc.clear();
                        state = ScanState::Scan;
                    }
                }
            }
        }
    }
}
