//! Length-delimited framing for byte-stream transports
//!
//! Frames on the serial link and the companion socket look like:
//!
//! - Byte 0: start marker (`'<'` from the client, `'>'` back to the client)
//! - Byte 1: payload length, low byte
//! - Byte 2: payload length, high byte
//! - Bytes 3+: payload
//!
//! The decoder is a byte-at-a-time state machine, so it produces the same
//! frames however the stream is chunked, and it resynchronizes on the next
//! start marker after garbage or a bad length.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::config::{FRAME_REPLY_MARKER, FRAME_START_MARKER, MAX_FRAME_SIZE};
use crate::error::{BridgeError, Result};

/// Frame header size (marker + 2 length bytes)
pub const FRAME_HEADER_SIZE: usize = 3;

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for a start marker
    Idle,
    /// Start marker seen, next byte is the length LSB
    HeaderFound,
    /// LSB seen, next byte is the length MSB
    Len1Found,
    /// Accumulating payload bytes
    Collecting,
}

/// Encoder and streaming decoder for marker-prefixed frames
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    rx_marker: u8,
    tx_marker: u8,
    state: ParseState,
    declared_len: usize,
    consumed: usize,
    buffer: BytesMut,
    malformed_frames: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Symmetric codec: encodes and decodes with `'<'`
    ///
    /// `max_frame_size` is capped at `u16::MAX`, the largest length the
    /// header can carry.
    pub fn new(max_frame_size: usize) -> Self {
        let max_frame_size = max_frame_size.min(u16::MAX as usize);
        Self {
            max_frame_size,
            rx_marker: FRAME_START_MARKER,
            tx_marker: FRAME_START_MARKER,
            state: ParseState::Idle,
            declared_len: 0,
            consumed: 0,
            buffer: BytesMut::with_capacity(max_frame_size),
            malformed_frames: 0,
        }
    }

    /// Node-side codec: decodes `'<'` frames, encodes `'>'` replies
    pub fn companion(max_frame_size: usize) -> Self {
        Self::new(max_frame_size).with_markers(FRAME_START_MARKER, FRAME_REPLY_MARKER)
    }

    /// Override the start markers
    pub fn with_markers(mut self, rx_marker: u8, tx_marker: u8) -> Self {
        self.rx_marker = rx_marker;
        self.tx_marker = tx_marker;
        self
    }

    /// Largest payload this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Current decoder state
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Frames rejected for a declared length outside `[1, max]`
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    /// Frame a payload
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        let too_large = BridgeError::FrameTooLarge {
            size: payload.len(),
            max: self.max_frame_size,
        };
        if payload.len() > self.max_frame_size {
            return Err(too_large);
        }
        if payload.is_empty() {
            return Err(BridgeError::EmptyFrame);
        }
        let len = u16::try_from(payload.len()).map_err(|_| too_large)?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u8(self.tx_marker);
        frame.put_u16_le(len);
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    /// Feed one byte; returns a payload when it completes a frame
    pub fn feed(&mut self, byte: u8) -> Option<Bytes> {
        match self.state {
            ParseState::Idle => {
                if byte == self.rx_marker {
                    self.state = ParseState::HeaderFound;
                }
                None
            }
            ParseState::HeaderFound => {
                self.declared_len = byte as usize;
                self.state = ParseState::Len1Found;
                None
            }
            ParseState::Len1Found => {
                self.declared_len |= (byte as usize) << 8;
                self.consumed = 0;
                self.buffer.clear();

                if let Err(e) = self.check_length(self.declared_len) {
                    trace!(error = %e, max = self.max_frame_size, "Resynchronizing");
                    self.malformed_frames += 1;
                    self.state = ParseState::Idle;
                } else {
                    self.state = ParseState::Collecting;
                }
                None
            }
            ParseState::Collecting => {
                if self.buffer.len() < self.max_frame_size {
                    self.buffer.put_u8(byte);
                }
                self.consumed += 1;

                if self.consumed >= self.declared_len {
                    self.state = ParseState::Idle;
                    let frame = self.buffer.split().freeze();
                    trace!(size = frame.len(), "Decoded frame");
                    Some(frame)
                } else {
                    None
                }
            }
        }
    }

    /// Feed bytes until the first completed frame
    ///
    /// Returns how many bytes of `data` were consumed; bytes after a completed
    /// frame are left for the next call.
    pub fn feed_until_frame(&mut self, data: &[u8]) -> (usize, Option<Bytes>) {
        for (i, &byte) in data.iter().enumerate() {
            if let Some(frame) = self.feed(byte) {
                return (i + 1, Some(frame));
            }
        }
        (data.len(), None)
    }

    /// Feed a whole buffer and collect every completed frame
    pub fn decode(&mut self, data: &[u8]) -> Vec<Bytes> {
        data.iter().filter_map(|&byte| self.feed(byte)).collect()
    }

    /// Checks a declared payload length against `[1, max_frame_size]`
    pub fn check_length(&self, declared: usize) -> Result<()> {
        if declared == 0 || declared > self.max_frame_size {
            return Err(BridgeError::MalformedLength { declared });
        }
        Ok(())
    }

    /// Drop any partial frame and return to `Idle`
    pub fn reset(&mut self) {
        self.state = ParseState::Idle;
        self.declared_len = 0;
        self.consumed = 0;
        self.buffer.clear();
    }
}
