//! Transports that move serialized mesh packets on and off the node
//!
//! - [`SocketTransport`] - framed packets over a single TCP companion client
//! - [`SerialTransport`] - framed packets over a serial link (`open` requires the `serial` feature)
//! - [`BrokerTransport`] - enveloped packets published to an MQTT-style broker
//!
//! Every transport is driven by a cooperative tick ([`Transport::poll`]) that
//! never blocks. Connection loss is never an error to the caller: it shows up
//! as `is_running() == false` and is recovered by the transport itself.
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   apt install libudev-dev pkg-config
//!   ```
//! - `mqtt`: Enables [`broker::RumqttClient`]

pub mod broker;
mod link;
mod serial;
mod socket;

pub use broker::{BrokerClient, BrokerMessage, BrokerTarget, BrokerTransport};
pub use serial::SerialTransport;
pub use socket::{Listener, SocketTransport};

use bytes::Bytes;
use tracing::info;

use crate::config::{BridgeConfig, TransportConfig};
use crate::error::{BridgeError, Result};

/// Capability shared by every transport
///
/// The mesh engine calls `begin` once, `poll` periodically, and
/// `send_packet` whenever it has a packet for the outside world.
pub trait Transport: Send {
    /// Transport name (for logging)
    fn name(&self) -> &str;

    /// Start the transport; connection failures are retried by `poll`
    fn begin(&mut self) -> Result<()>;

    /// Stop the transport and drop all pending state
    fn end(&mut self);

    /// True while the transport can currently deliver packets
    fn is_running(&self) -> bool;

    /// Hand a serialized packet to the transport
    ///
    /// Returns the number of payload bytes accepted. `Ok(0)` means the packet
    /// was dropped because nothing is connected.
    fn send_packet(&mut self, packet: &[u8]) -> Result<usize>;

    /// Run one cooperative tick
    ///
    /// Returns at most one inbound packet.
    fn poll(&mut self) -> Option<Bytes>;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Counters since construction
    fn stats(&self) -> TransportStats;

    /// Select broker profile `index`
    fn switch_to_server(&mut self, index: u8) -> Result<()> {
        let _ = index;
        Err(BridgeError::Unsupported(self.name().to_string()))
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn end(&mut self) {
        (**self).end()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<usize> {
        (**self).send_packet(packet)
    }

    fn poll(&mut self) -> Option<Bytes> {
        (**self).poll()
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }

    fn switch_to_server(&mut self, index: u8) -> Result<()> {
        (**self).switch_to_server(index)
    }
}

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped
    Disabled,
    /// Running but no peer or broker session
    Disconnected,
    /// Connect attempt in progress
    Connecting,
    /// Peer or broker session up
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disabled => write!(f, "disabled"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Per-transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames or envelopes written out
    pub frames_sent: u64,
    /// Frames or envelopes accepted inbound
    pub frames_received: u64,
    /// Sends refused because the outbound queue was full
    pub queue_rejections: u64,
    /// Sends refused because the payload was too large
    pub oversized_rejections: u64,
    /// Inbound frames dropped for a bad length
    pub malformed_frames: u64,
    /// Inbound envelopes dropped for bad magic, checksum, or size
    pub envelope_rejections: u64,
    /// Inbound messages ignored (send-only broker)
    pub inbound_discarded: u64,
    /// Packets dropped because nothing was connected
    pub dropped_disconnected: u64,
    /// Queued frames discarded when a peer went away
    pub frames_discarded: u64,
    /// Peer or broker sessions lost
    pub connection_losses: u64,
    /// Broker connect attempts
    pub connect_attempts: u64,
    /// Socket clients accepted
    pub clients_accepted: u64,
}

/// Build the transport named by `config`
///
/// Broker transports need the `mqtt` feature; serial transports need the
/// `serial` feature.
pub fn build_transport(config: &BridgeConfig) -> Result<Box<dyn Transport>> {
    config.validate()?;
    match &config.transport {
        TransportConfig::Socket { host, port } => {
            info!(host = %host, port = port, "Building socket transport");
            let transport = SocketTransport::bind((host.as_str(), *port), &config.framing)?;
            Ok(Box::new(transport))
        }
        #[cfg(feature = "serial")]
        TransportConfig::Serial { port, baud_rate } => {
            info!(port = %port.display(), baud = baud_rate, "Building serial transport");
            let transport = SerialTransport::open(port, *baud_rate, &config.framing)?;
            Ok(Box::new(transport))
        }
        #[cfg(not(feature = "serial"))]
        TransportConfig::Serial { .. } => Err(BridgeError::InvalidConfig(
            "serial transport requires the `serial` feature".to_string(),
        )),
        #[cfg(feature = "mqtt")]
        TransportConfig::Broker(broker) => {
            info!(
                broker = %broker.active_profile().host,
                port = broker.active_profile().port,
                "Building broker transport"
            );
            let transport = BrokerTransport::new(
                broker::RumqttClient::new(),
                broker.clone(),
                crate::clock::MonotonicClock::shared(),
            )?;
            Ok(Box::new(transport))
        }
        #[cfg(not(feature = "mqtt"))]
        TransportConfig::Broker(_) => Err(BridgeError::InvalidConfig(
            "broker transport requires the `mqtt` feature".to_string(),
        )),
    }
}
