//! Test utilities for exercising transports without a network or a radio
//!
//! Every mock here is a cheap handle over shared state: clone it, hand one
//! copy to the transport, and keep the other to play the remote side.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcore_bridge::test_utils::MockListener;
//! use meshcore_bridge::{FramingConfig, SocketTransport, Transport};
//!
//! let listener = MockListener::new();
//! let mut transport = SocketTransport::new(listener.clone(), &FramingConfig::default());
//! transport.begin().unwrap();
//!
//! let peer = listener.connect();
//! peer.send(&[0x3C, 0x01, 0x00, 0x42]);
//! assert_eq!(transport.poll().unwrap().as_ref(), &[0x42]);
//! ```

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::error::{BridgeError, Result};
use crate::packet::{header_byte, PayloadType, RouteType};
use crate::transport::{BrokerClient, BrokerMessage, BrokerTarget, Listener};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clock that only moves when told to
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock at t = 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Jump to `ms`
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Move forward by `ms`
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    closed: bool,
}

/// In-memory byte stream
///
/// The transport side reads what the test `send`s and the test reads what
/// the transport writes via `received`. Reads with nothing buffered report
/// `WouldBlock`, like a non-blocking socket.
#[derive(Debug, Clone, Default)]
pub struct MockStream {
    state: Arc<Mutex<StreamState>>,
}

impl MockStream {
    /// Open stream with empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes the remote side sends to the transport
    pub fn send(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes.iter().copied());
    }

    /// Everything the transport has written so far
    pub fn received(&self) -> Vec<u8> {
        lock(&self.state).outbound.clone()
    }

    /// Close the stream; buffered inbound bytes are still readable
    pub fn close(&self) {
        lock(&self.state).closed = true;
    }

    /// True after [`close`](Self::close)
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.inbound.is_empty() {
            return if state.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Listener fed by [`MockListener::connect`]
#[derive(Debug, Clone, Default)]
pub struct MockListener {
    pending: Arc<Mutex<VecDeque<MockStream>>>,
}

impl MockListener {
    /// Listener with no pending connections
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new connection and return the remote end
    pub fn connect(&self) -> MockStream {
        let stream = MockStream::new();
        lock(&self.pending).push_back(stream.clone());
        stream
    }
}

impl Listener for MockListener {
    type Stream = MockStream;

    fn accept_pending(&mut self) -> io::Result<Option<MockStream>> {
        Ok(lock(&self.pending).pop_front())
    }
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    connected: bool,
    target: Option<BrokerTarget>,
    connect_attempts: usize,
    disconnects: usize,
    subscriptions: Vec<String>,
    published: Vec<BrokerMessage>,
    inbound: VecDeque<BrokerMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connected: false,
            target: None,
            connect_attempts: 0,
            disconnects: 0,
            subscriptions: Vec::new(),
            published: Vec::new(),
            inbound: VecDeque::new(),
        }
    }
}

/// Broker client that connects instantly when reachable
#[derive(Debug, Clone, Default)]
pub struct MockBrokerClient {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBrokerClient {
    /// Reachable broker, not connected
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether future connect attempts succeed
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self) {
        lock(&self.state).connected = false;
    }

    /// Deliver a message on the next `poll_message`
    pub fn push_inbound(&self, topic: &str, payload: Bytes) {
        lock(&self.state).inbound.push_back(BrokerMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Target the client was last pointed at
    pub fn current_target(&self) -> Option<BrokerTarget> {
        lock(&self.state).target.clone()
    }

    /// Number of connect calls
    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    /// Number of disconnect calls
    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    /// Topics subscribed so far, in order
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state).subscriptions.clone()
    }

    /// Messages published so far, in order
    pub fn published(&self) -> Vec<BrokerMessage> {
        lock(&self.state).published.clone()
    }
}

impl BrokerClient for MockBrokerClient {
    fn set_target(&mut self, target: BrokerTarget) {
        lock(&self.state).target = Some(target);
    }

    fn connect(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        let (host, port) = state
            .target
            .as_ref()
            .map(|t| (t.host.clone(), t.port))
            .unwrap_or_default();
        if !state.reachable {
            return Err(BridgeError::BrokerUnreachable {
                host,
                port,
                reason: "simulated outage".to_string(),
            });
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = lock(&self.state);
        state.disconnects += 1;
        state.connected = false;
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(BridgeError::NotConnected);
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(BridgeError::NotConnected);
        }
        state.published.push(BrokerMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn poll_message(&mut self) -> Option<BrokerMessage> {
        let mut state = lock(&self.state);
        if !state.connected {
            return None;
        }
        state.inbound.pop_front()
    }
}

/// Serialized flood-routed group text packet for `channel_hash`
///
/// The encrypted body is random, the way real ciphertext looks on the wire.
pub fn group_text_packet(channel_hash: u8, body_len: usize) -> Vec<u8> {
    let mut packet = vec![header_byte(PayloadType::GrpTxt, RouteType::Flood), 0x00, channel_hash];
    packet.extend((0..body_len).map(|_| rand::random::<u8>()));
    packet
}

/// Serialized flood-routed advert packet
pub fn advert_packet(body_len: usize) -> Vec<u8> {
    let mut packet = vec![header_byte(PayloadType::Advert, RouteType::Flood), 0x00];
    packet.extend((0..body_len).map(|_| rand::random::<u8>()));
    packet
}

/// Serial ports visible to the OS, for `#[ignore]`d tests run against real hardware
#[cfg(feature = "serial")]
pub fn list_serial_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|port| port.port_name).collect())
        .unwrap_or_default()
}
