//! Single-client TCP companion transport
//!
//! One peer at a time. A new connection always wins: the previous peer is
//! dropped along with its queued frames and its half-parsed input.

use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, trace, warn};

use super::link::{FramedLink, ReadOutcome};
use super::{ConnectionState, Transport, TransportStats};
use crate::config::FramingConfig;
use crate::error::{BridgeError, Result};

/// Upper bound on stale connections refused when re-enabling
const MAX_BACKLOG_DRAIN: usize = 64;

/// Source of incoming peer connections
pub trait Listener: Send {
    /// Stream type for an accepted peer
    type Stream: Read + Write + Send;

    /// Accept one pending connection without blocking
    fn accept_pending(&mut self) -> io::Result<Option<Self::Stream>>;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    fn accept_pending(&mut self) -> io::Result<Option<TcpStream>> {
        match self.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                debug!(peer = %peer, "Accepted TCP connection");
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Framed transport over one accepted stream
pub struct SocketTransport<L: Listener> {
    listener: L,
    client: Option<L::Stream>,
    link: FramedLink,
    enabled: bool,
    // Connections queued by the OS while disabled must not be served
    stale_backlog: bool,
    name: String,
}

impl SocketTransport<TcpListener> {
    /// Bind a non-blocking listener
    pub fn bind(addr: impl ToSocketAddrs, framing: &FramingConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let name = format!("socket:{}", listener.local_addr()?);
        info!(transport = %name, "Socket listener bound");

        let mut transport = Self::new(listener, framing);
        transport.name = name;
        Ok(transport)
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl<L: Listener> SocketTransport<L> {
    /// Wrap an existing listener; the transport starts disabled
    pub fn new(listener: L, framing: &FramingConfig) -> Self {
        Self {
            listener,
            client: None,
            link: FramedLink::new(framing),
            enabled: false,
            stale_backlog: false,
            name: "socket".to_string(),
        }
    }

    /// Start accepting peers
    pub fn enable(&mut self) {
        if self.enabled {
            return;
        }
        if self.stale_backlog {
            self.drain_backlog();
        }
        self.link.reset();
        self.enabled = true;
        info!(transport = %self.name, "Socket transport enabled");
    }

    /// Drop the peer and every buffer
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.client = None;
        self.link.reset();
        self.enabled = false;
        self.stale_backlog = true;
        info!(transport = %self.name, "Socket transport disabled");
    }

    fn drain_backlog(&mut self) {
        let mut refused = 0;
        while refused < MAX_BACKLOG_DRAIN {
            match self.listener.accept_pending() {
                Ok(Some(_stream)) => refused += 1,
                Ok(None) => break,
                Err(e) => {
                    warn!(transport = %self.name, error = %e, "Accept failed while draining backlog");
                    break;
                }
            }
        }
        if refused > 0 {
            debug!(
                transport = %self.name,
                refused = refused,
                "Closed connections made while disabled"
            );
        }
        self.stale_backlog = false;
    }

    /// True after [`enable`](Self::enable)
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True while a peer is attached
    pub fn is_connected(&self) -> bool {
        self.enabled && self.client.is_some()
    }

    /// Frames waiting to be written
    pub fn queued_frames(&self) -> usize {
        self.link.queued()
    }

    /// Queue a payload for the current peer
    ///
    /// Returns `Ok(0)` without queuing when no peer is connected.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize> {
        let max = self.link.max_frame_size();
        if payload.len() > max {
            self.link.stats.oversized_rejections += 1;
            return Err(BridgeError::FrameTooLarge {
                size: payload.len(),
                max,
            });
        }
        if !self.is_connected() {
            self.link.stats.dropped_disconnected += 1;
            trace!(transport = %self.name, "No peer connected, dropping frame");
            return Ok(0);
        }
        self.link.queue_frame(payload)
    }

    /// One tick: accept, then write one frame or read one frame
    pub fn check_recv_frame(&mut self) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }
        self.accept_new_client();

        let stream = self.client.as_mut()?;

        if self.link.has_outbound() {
            if let Err(e) = self.link.write_one(stream) {
                self.drop_client(&e.to_string());
            }
            return None;
        }

        match self.link.read_frame(stream) {
            Ok(ReadOutcome::Frame(frame)) => {
                debug!(transport = %self.name, size = frame.len(), "Received frame");
                Some(frame)
            }
            Ok(ReadOutcome::Idle) => None,
            Ok(ReadOutcome::Closed) => {
                self.drop_client("peer closed connection");
                None
            }
            Err(e) => {
                self.drop_client(&e.to_string());
                None
            }
        }
    }

    fn accept_new_client(&mut self) {
        match self.listener.accept_pending() {
            Ok(Some(stream)) => {
                if self.client.take().is_some() {
                    let discarded = self.link.reset();
                    info!(
                        transport = %self.name,
                        discarded = discarded,
                        "New client replaces existing connection"
                    );
                } else {
                    self.link.reset();
                    info!(transport = %self.name, "Client connected");
                }
                self.client = Some(stream);
                self.link.stats.clients_accepted += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(transport = %self.name, error = %e, "Accept failed"),
        }
    }

    fn drop_client(&mut self, reason: &str) {
        self.client = None;
        let discarded = self.link.reset();
        self.link.stats.connection_losses += 1;
        info!(
            transport = %self.name,
            reason = reason,
            discarded = discarded,
            "Client disconnected"
        );
    }
}

impl<L: Listener> Transport for SocketTransport<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) -> Result<()> {
        self.enable();
        Ok(())
    }

    fn end(&mut self) {
        self.disable();
    }

    fn is_running(&self) -> bool {
        self.is_connected()
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<usize> {
        self.write_frame(packet)
    }

    fn poll(&mut self) -> Option<Bytes> {
        self.check_recv_frame()
    }

    fn state(&self) -> ConnectionState {
        if !self.enabled {
            ConnectionState::Disabled
        } else if self.client.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn stats(&self) -> TransportStats {
        self.link.stats
    }
}
