//! Framed byte-stream plumbing shared by the socket and serial transports
//!
//! A tick either makes progress on one outbound frame or reads inbound bytes,
//! never both. A frame that only partly fits into the OS buffer stays in
//! flight and is resumed on the next tick. Bytes read past the end of a
//! frame stay pending for the next tick, so back-to-back frames are never
//! lost.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};
use tracing::{trace, warn};

use super::TransportStats;
use crate::codec::FrameCodec;
use crate::config::FramingConfig;
use crate::error::{BridgeError, Result};
use crate::queue::OutboundQueue;

/// Bytes requested per read call
const READ_CHUNK_SIZE: usize = 256;

/// Read calls per tick before yielding
const MAX_READS_PER_TICK: usize = 8;

/// Outcome of one inbound read pass
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// A complete frame payload
    Frame(Bytes),
    /// No complete frame yet
    Idle,
    /// The stream reached end of file
    Closed,
}

/// Non-blocking sockets report "no data" as `WouldBlock`; serial ports with a
/// zero timeout report `TimedOut`
fn no_data(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[derive(Debug)]
pub(crate) struct FramedLink {
    codec: FrameCodec,
    queue: OutboundQueue,
    rx_pending: BytesMut,
    tx_inflight: Bytes,
    pub(crate) stats: TransportStats,
}

impl FramedLink {
    pub(crate) fn new(framing: &FramingConfig) -> Self {
        Self {
            codec: FrameCodec::companion(framing.max_frame_size),
            queue: OutboundQueue::new(framing.queue_size, framing.max_frame_size),
            rx_pending: BytesMut::with_capacity(READ_CHUNK_SIZE),
            tx_inflight: Bytes::new(),
            stats: TransportStats::default(),
        }
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.codec.max_frame_size()
    }

    /// Validate and queue a payload for a later tick
    pub(crate) fn queue_frame(&mut self, payload: &[u8]) -> Result<usize> {
        if payload.is_empty() {
            return Err(BridgeError::EmptyFrame);
        }
        match self.queue.enqueue(payload) {
            Ok(()) => Ok(payload.len()),
            Err(e) => {
                match e {
                    BridgeError::FrameTooLarge { .. } => self.stats.oversized_rejections += 1,
                    BridgeError::QueueFull { .. } => self.stats.queue_rejections += 1,
                    _ => {}
                }
                Err(e)
            }
        }
    }

    /// True while a frame is queued or partly written
    pub(crate) fn has_outbound(&self) -> bool {
        !self.tx_inflight.is_empty() || !self.queue.is_empty()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Make progress on one outbound frame
    pub(crate) fn write_one<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        if self.tx_inflight.is_empty() {
            let Some(entry) = self.queue.dequeue_one() else {
                return Ok(());
            };
            match self.codec.encode(entry.payload()) {
                Ok(frame) => self.tx_inflight = frame,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    return Ok(());
                }
            }
        }

        while !self.tx_inflight.is_empty() {
            match writer.write(&self.tx_inflight) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.tx_inflight.advance(n),
                Err(e) if no_data(&e) => {
                    trace!(remaining = self.tx_inflight.len(), "Write would block, resuming next tick");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        match writer.flush() {
            Err(e) if !no_data(&e) => return Err(e),
            _ => {}
        }

        self.stats.frames_sent += 1;
        trace!(queued = self.queue.len(), "Frame written");
        Ok(())
    }

    /// Read available bytes until one frame completes
    pub(crate) fn read_frame<R: Read>(&mut self, reader: &mut R) -> io::Result<ReadOutcome> {
        if let Some(frame) = self.feed_pending() {
            return Ok(ReadOutcome::Frame(frame));
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        for _ in 0..MAX_READS_PER_TICK {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    trace!(bytes = n, "Read from stream");
                    self.rx_pending.extend_from_slice(&chunk[..n]);
                    if let Some(frame) = self.feed_pending() {
                        return Ok(ReadOutcome::Frame(frame));
                    }
                }
                Err(e) if no_data(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Idle)
    }

    fn feed_pending(&mut self) -> Option<Bytes> {
        if self.rx_pending.is_empty() {
            return None;
        }
        let (used, frame) = self.codec.feed_until_frame(&self.rx_pending);
        self.rx_pending.advance(used);
        self.stats.malformed_frames = self.codec.malformed_frames();
        if frame.is_some() {
            self.stats.frames_received += 1;
        }
        frame
    }

    /// Drop queued, in-flight, and partially parsed data
    ///
    /// Returns how many frames were discarded.
    pub(crate) fn reset(&mut self) -> usize {
        let mut discarded = self.queue.clear();
        if !self.tx_inflight.is_empty() {
            discarded += 1;
            self.tx_inflight = Bytes::new();
        }
        self.rx_pending.clear();
        self.codec.reset();
        self.stats.frames_discarded += discarded as u64;
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Reader that hands out scripted chunks, then reports `WouldBlock`
    struct ChunkedReader {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Writer that accepts at most `budget` bytes per call
    struct TrickleWriter {
        written: Vec<u8>,
        budget: usize,
        calls_left: usize,
    }

    impl Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.calls_left == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.calls_left -= 1;
            let n = buf.len().min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn link() -> FramedLink {
        FramedLink::new(&FramingConfig::default())
    }

    #[test]
    fn test_back_to_back_frames_survive_one_read() {
        let mut link = link();
        let mut reader = ChunkedReader {
            chunks: VecDeque::from([vec![0x3C, 0x01, 0x00, 0xAA, 0x3C, 0x02, 0x00, 0xBB, 0xCC]]),
            eof: false,
        };

        assert_eq!(
            link.read_frame(&mut reader).unwrap(),
            ReadOutcome::Frame(Bytes::from_static(&[0xAA]))
        );
        assert_eq!(
            link.read_frame(&mut reader).unwrap(),
            ReadOutcome::Frame(Bytes::from_static(&[0xBB, 0xCC]))
        );
        assert_eq!(link.read_frame(&mut reader).unwrap(), ReadOutcome::Idle);
        assert_eq!(link.stats.frames_received, 2);
    }

    #[test]
    fn test_eof_reported_as_closed() {
        let mut link = link();
        let mut reader = ChunkedReader {
            chunks: VecDeque::new(),
            eof: true,
        };
        assert_eq!(link.read_frame(&mut reader).unwrap(), ReadOutcome::Closed);
    }

    #[test]
    fn test_partial_write_resumes() {
        let mut link = link();
        link.queue_frame(&[1, 2, 3, 4, 5]).unwrap();

        let mut writer = TrickleWriter {
            written: Vec::new(),
            budget: 3,
            calls_left: 1,
        };
        link.write_one(&mut writer).unwrap();
        assert_eq!(writer.written, vec![0x3E, 0x05, 0x00]);
        assert!(link.has_outbound());
        assert_eq!(link.stats.frames_sent, 0);

        writer.calls_left = 4;
        link.write_one(&mut writer).unwrap();
        assert_eq!(writer.written, vec![0x3E, 0x05, 0x00, 1, 2, 3, 4, 5]);
        assert!(!link.has_outbound());
        assert_eq!(link.stats.frames_sent, 1);
    }

    #[test]
    fn test_queue_rejections_counted() {
        let mut link = FramedLink::new(&FramingConfig {
            max_frame_size: 4,
            queue_size: 1,
        });
        assert!(matches!(
            link.queue_frame(&[0; 5]),
            Err(BridgeError::FrameTooLarge { .. })
        ));
        link.queue_frame(&[1]).unwrap();
        assert!(matches!(
            link.queue_frame(&[2]),
            Err(BridgeError::QueueFull { .. })
        ));
        assert!(matches!(link.queue_frame(&[]), Err(BridgeError::EmptyFrame)));
        assert_eq!(link.stats.oversized_rejections, 1);
        assert_eq!(link.stats.queue_rejections, 1);
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut link = link();
        link.queue_frame(&[1]).unwrap();
        link.queue_frame(&[2]).unwrap();
        let mut reader = ChunkedReader {
            chunks: VecDeque::from([vec![0x3C, 0x03, 0x00, 0x01]]),
            eof: false,
        };
        assert_eq!(link.read_frame(&mut reader).unwrap(), ReadOutcome::Idle);

        assert_eq!(link.reset(), 2);
        assert!(!link.has_outbound());
        assert_eq!(link.stats.frames_discarded, 2);

        // The partial frame above must not complete after the reset
        let mut reader = ChunkedReader {
            chunks: VecDeque::from([vec![0x02, 0x03]]),
            eof: false,
        };
        assert_eq!(link.read_frame(&mut reader).unwrap(), ReadOutcome::Idle);
    }
}
