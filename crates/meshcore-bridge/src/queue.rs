//! Fixed-capacity outbound frame queue
//!
//! Strict FIFO. When the queue is full the newest frame is rejected; the
//! frames already queued are never evicted.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::config::{FRAME_QUEUE_SIZE, MAX_FRAME_SIZE};
use crate::error::{BridgeError, Result};

/// A frame payload waiting to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    payload: Bytes,
}

impl QueueEntry {
    /// Payload length
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for a zero-length entry
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Take the payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Bounded FIFO of outbound frames
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    max_frame_size: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(FRAME_QUEUE_SIZE, MAX_FRAME_SIZE)
    }
}

impl OutboundQueue {
    /// Create a queue holding up to `capacity` frames of `max_frame_size` bytes
    pub fn new(capacity: usize, max_frame_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_frame_size,
        }
    }

    /// Copy a payload into the queue
    pub fn enqueue(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_frame_size {
            debug!(
                size = payload.len(),
                max = self.max_frame_size,
                "Rejecting oversized frame"
            );
            return Err(BridgeError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        if self.is_full() {
            debug!(capacity = self.capacity, "Outbound queue full, dropping frame");
            return Err(BridgeError::QueueFull {
                capacity: self.capacity,
            });
        }

        self.entries.push_back(QueueEntry {
            payload: Bytes::copy_from_slice(payload),
        });
        trace!(queued = self.entries.len(), "Frame queued");
        Ok(())
    }

    /// Remove and return the oldest frame
    pub fn dequeue_one(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Oldest frame without removing it
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Number of queued frames
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when no slot is free
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued frame, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new(3, 16);
        queue.enqueue(b"a").unwrap();
        queue.enqueue(b"bb").unwrap();
        queue.enqueue(b"ccc").unwrap();

        assert_eq!(queue.dequeue_one().unwrap().payload().as_ref(), b"a");
        assert_eq!(queue.dequeue_one().unwrap().payload().as_ref(), b"bb");
        assert_eq!(queue.dequeue_one().unwrap().len(), 3);
        assert!(queue.dequeue_one().is_none());
    }

    #[test]
    fn test_overflow_rejects_newest() {
        let mut queue = OutboundQueue::default();
        for i in 0..FRAME_QUEUE_SIZE {
            queue.enqueue(&[i as u8]).unwrap();
        }
        let err = queue.enqueue(&[0xFF]).unwrap_err();
        assert!(matches!(err, BridgeError::QueueFull { capacity: FRAME_QUEUE_SIZE }));
        assert_eq!(queue.len(), FRAME_QUEUE_SIZE);

        for i in 0..FRAME_QUEUE_SIZE {
            assert_eq!(queue.dequeue_one().unwrap().payload().as_ref(), &[i as u8]);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_oversize_leaves_queue_untouched() {
        let mut queue = OutboundQueue::new(2, 4);
        queue.enqueue(b"ok").unwrap();
        assert!(matches!(
            queue.enqueue(b"too long"),
            Err(BridgeError::FrameTooLarge { size: 8, max: 4 })
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_entries_are_copies() {
        let mut queue = OutboundQueue::new(1, 8);
        let mut source = vec![1u8, 2, 3];
        queue.enqueue(&source).unwrap();
        source[0] = 9;
        assert_eq!(queue.peek().unwrap().payload().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_clear() {
        let mut queue = OutboundQueue::new(4, 8);
        queue.enqueue(b"x").unwrap();
        queue.enqueue(b"y").unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
