//! Tolerant byte-stream parsers that recover HCP1 frames.
//!
//! The bus is half duplex and noisy: frames arrive back to back, sync
//! breaks show up as runs of zero bytes, and a collision can corrupt any
//! byte. Two parser variants share the same preprocessing but trade
//! robustness differently:
//!
//! - [`StrictParser`] assumes the next byte starts a frame. It is cheap
//!   and loses nothing on a clean line, but one corrupt byte can take the
//!   following frame down with it.
//! - [`SalvageParser`] tries every byte offset in a sliding window as a
//!   candidate frame start. It digs valid frames out of garbage at the
//!   cost of rare false positives from CRC-8 collisions.
//!
//! Both are driven with wall-clock timestamps so that bus idle time
//! (at least one frame time between cycles) resets partial state.

use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use super::crc::crc8;
use super::packet::{Packet, MAX_FRAME_LEN, MIN_FRAME_LEN};

/// Window size of the salvage parser. Anything smaller than two maximum
/// frames less one byte could starve a frame that straddles a drop.
const WINDOW_CAP: usize = 2 * MAX_FRAME_LEN - 1;

/// Knobs shared by both parser variants.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Drop accumulated state when the line goes quiet for this long.
    pub inactivity_timeout: Duration,

    /// Keep only the trailing [`MAX_FRAME_LEN`] bytes of an oversized
    /// read chunk. A longer chunk cannot belong to a single frame.
    pub filter_max_length: bool,

    /// Swallow sync-break zero bytes at the start of a chunk.
    pub filter_breaks: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_millis(50),
            filter_max_length: true,
            filter_breaks: true,
        }
    }
}

impl ParserConfig {
    /// Applies chunk-level filters before any candidate inspection.
    fn preprocess<'a>(&self, buffer_empty: bool, mut chunk: &'a [u8]) -> &'a [u8] {
        if self.filter_max_length && chunk.len() > MAX_FRAME_LEN {
            chunk = &chunk[chunk.len() - MAX_FRAME_LEN..];
        }

        if self.filter_breaks && buffer_empty {
            // A BREAK condition reads as zero bytes. A chunk of nothing
            // but zeros is a bare break; a longer zero run in front of
            // data is a break glued to a broadcast frame, whose own
            // address byte is the single zero we keep.
            if chunk.iter().all(|&b| b == 0x00) {
                return &[];
            }

            let zeros = chunk.iter().take_while(|&&b| b == 0x00).count();
            if zeros > 1 {
                chunk = &chunk[zeros - 1..];
            }
        }

        chunk
    }
}

/// A byte-stream parser emitting [`Packet`] values.
pub trait FrameParser: Send {
    /// Feeds a read chunk observed at `now`, appending any completed
    /// frames to `out`.
    fn push(&mut self, chunk: &[u8], now: Instant, out: &mut Vec<Packet>);

    /// Drops all accumulated state.
    fn reset(&mut self);
}

/// Frame length declared by a length byte.
fn declared_frame_len(length_byte: u8) -> usize {
    3 + (length_byte & 0x0f) as usize
}

/// Strict single-pass parser.
///
/// Interprets byte 0 as the address and byte 1 as the length byte, which
/// fixes the frame length. On a CRC match the frame is emitted; on a
/// mismatch the whole buffer is dropped and parsing restarts with the
/// next byte.
pub struct StrictParser {
    config: ParserConfig,
    state: StrictState,
    buf: BytesMut,
    last_activity: Option<Instant>,
}

/// Where the strict parser is inside the current candidate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrictState {
    /// Waiting for an address byte.
    Sync,
    /// Address seen, waiting for the length byte.
    AwaitLength,
    /// Length known, collecting until the frame is complete.
    Body { frame_len: usize },
}

impl StrictParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            state: StrictState::Sync,
            buf: BytesMut::with_capacity(MAX_FRAME_LEN),
            last_activity: None,
        }
    }

    fn feed(&mut self, byte: u8, out: &mut Vec<Packet>) {
        self.buf.extend_from_slice(&[byte]);

        match self.state {
            StrictState::Sync => {
                self.state = StrictState::AwaitLength;
            }
            StrictState::AwaitLength => {
                let frame_len = declared_frame_len(byte);
                if frame_len < MIN_FRAME_LEN {
                    // Zero-length payloads do not occur on this bus.
                    trace!(length_byte = byte, "dropping zero-payload candidate");
                    self.restart();
                    return;
                }
                self.state = StrictState::Body { frame_len };
            }
            StrictState::Body { frame_len } => {
                if self.buf.len() < frame_len {
                    return;
                }

                let body = &self.buf[..frame_len - 1];
                let expected = crc8(body).ok();
                if expected == Some(self.buf[frame_len - 1]) {
                    match Packet::from_bytes(&self.buf[..frame_len]) {
                        Ok(packet) => {
                            trace!(frame = %packet, "frame");
                            out.push(packet);
                        }
                        Err(err) => debug!(%err, "discarding frame"),
                    }
                } else {
                    debug!(
                        buffered = self.buf.len(),
                        "CRC mismatch, dropping buffer"
                    );
                }
                self.restart();
            }
        }
    }

    fn restart(&mut self) {
        self.buf.clear();
        self.state = StrictState::Sync;
    }
}

impl FrameParser for StrictParser {
    fn push(&mut self, chunk: &[u8], now: Instant, out: &mut Vec<Packet>) {
        if let Some(last) = self.last_activity {
            if now.duration_since(last) > self.config.inactivity_timeout {
                trace!("line idle, resetting parser");
                self.restart();
            }
        }
        self.last_activity = Some(now);

        let chunk = self.config.preprocess(self.buf.is_empty(), chunk);
        for &byte in chunk {
            self.feed(byte, out);
        }
    }

    fn reset(&mut self) {
        self.restart();
        self.last_activity = None;
    }
}

/// Batch-salvage parser.
///
/// Keeps a sliding window and tests every untried byte offset as a
/// candidate frame start: read the declared length, wait for enough
/// data, verify the CRC. A hit emits the frame and discards the
/// consumed prefix including any leading garbage; a miss marks the
/// offset as tested. A window that fills up without a hit is dropped
/// wholesale.
pub struct SalvageParser {
    config: ParserConfig,
    window: BytesMut,
    /// One bit per window offset that already failed as a frame start.
    tested: u64,
    last_activity: Option<Instant>,
}

impl SalvageParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            window: BytesMut::with_capacity(WINDOW_CAP + MAX_FRAME_LEN),
            tested: 0,
            last_activity: None,
        }
    }

    fn scan(&mut self, out: &mut Vec<Packet>) {
        'rescan: loop {
            // One bitmap bit per offset. With chunk clamping disabled a
            // single push can grow the window past the bitmap width;
            // offsets beyond it stay untested and fall to the
            // window-full drop below.
            let testable = self.window.len().min(u64::BITS as usize);
            for offset in 0..testable {
                if self.tested & (1 << offset) != 0 {
                    continue;
                }
                if self.window.len() - offset < MIN_FRAME_LEN {
                    // Too little data to judge this or any later offset.
                    return;
                }

                let frame_len = declared_frame_len(self.window[offset + 1]);
                if frame_len < MIN_FRAME_LEN {
                    self.tested |= 1 << offset;
                    continue;
                }
                if offset + frame_len > self.window.len() {
                    // Candidate still incomplete, revisit on the next chunk.
                    continue;
                }

                let candidate = &self.window[offset..offset + frame_len];
                if crc8(&candidate[..frame_len - 1]).ok() == Some(candidate[frame_len - 1]) {
                    if let Ok(packet) = Packet::from_bytes_unchecked(candidate) {
                        trace!(skipped = offset, frame = %packet, "salvaged frame");
                        out.push(packet);
                    }
                    self.window.advance(offset + frame_len);
                    self.tested = 0;
                    continue 'rescan;
                }

                self.tested |= 1 << offset;
            }
            return;
        }
    }

    fn drop_window(&mut self) {
        self.window.clear();
        self.tested = 0;
    }
}

impl FrameParser for SalvageParser {
    fn push(&mut self, chunk: &[u8], now: Instant, out: &mut Vec<Packet>) {
        if let Some(last) = self.last_activity {
            if now.duration_since(last) > self.config.inactivity_timeout {
                trace!("line idle, resetting parser");
                self.drop_window();
            }
        }
        self.last_activity = Some(now);

        let chunk = self.config.preprocess(self.window.is_empty(), chunk);
        self.window.extend_from_slice(chunk);
        self.scan(out);

        if self.window.len() >= WINDOW_CAP {
            debug!(
                buffered = self.window.len(),
                "window full without a frame, dropping"
            );
            self.drop_window();
        }
    }

    fn reset(&mut self) {
        self.drop_window();
        self.last_activity = None;
    }
}
