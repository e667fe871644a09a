//! MeshCore Transport Bridge & Framing
//!
//! This crate moves serialized MeshCore mesh packets between a node's
//! routing engine and the outside world: a companion client on a TCP socket
//! or serial link, or an MQTT broker shared with other nodes.
//!
//! # Architecture
//!
//! The bridge operates in three layers:
//!
//! 1. **Wire formats** - length-prefixed frames ([`FrameCodec`]) for byte
//!    streams, checksummed envelopes ([`envelope`]) for the broker
//! 2. **Transports** - cooperative, non-blocking state machines
//!    ([`SocketTransport`], [`SerialTransport`], [`BrokerTransport`]) behind
//!    one [`Transport`] trait
//! 3. **Service** - an async [`BridgeService`] that ticks a transport on a
//!    tokio interval and is controlled through a [`BridgeHandle`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshcore_bridge::{build_transport, BridgeConfigBuilder, BridgeService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfigBuilder::new().socket("0.0.0.0", 5000).build();
//!     let transport = build_transport(&config)?;
//!
//!     let (service, handle) = BridgeService::new(
//!         transport,
//!         &config.service,
//!         Arc::new(|packet| println!("Received {} bytes", packet.len())),
//!     );
//!     tokio::spawn(service.run());
//!
//!     handle.send_packet(vec![0x15, 0x00, 0xD5, 0x01]).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - [`SerialTransport::open`] (requires `libudev-dev` on Linux)
//! - `mqtt` - [`RumqttClient`], a broker client backed by `rumqttc`
//!
//! # Protocol Details
//!
//! Byte-stream frames:
//! - Byte 0: `'<'` (0x3C) toward the node, `'>'` (0x3E) from the node
//! - Bytes 1-2: payload length (little-endian u16, 1..=172)
//! - Bytes 3+: payload
//!
//! Broker envelopes:
//! - Bytes 0-1: magic `0xC03E` (big-endian)
//! - Bytes 2-3: Fletcher-16 of the payload (little-endian)
//! - Bytes 4+: serialized mesh packet

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Wire formats
pub mod checksum;
pub mod codec;
pub mod envelope;
pub mod packet;
pub mod queue;

// Configuration and errors
pub mod clock;
pub mod config;
pub mod error;

// Transports
pub mod topic;
pub mod transport;

// Async driver
pub mod service;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience - wire formats
pub use checksum::{fletcher16, validate_checksum};
pub use codec::{FrameCodec, ParseState, FRAME_HEADER_SIZE};
pub use envelope::ENVELOPE_HEADER_SIZE;
pub use packet::{PacketView, PayloadType, RouteType};
pub use queue::{OutboundQueue, QueueEntry};

// Re-exports for convenience - configuration
pub use clock::{Clock, MonotonicClock, SharedClock};
pub use config::{
    client_id_for, BridgeConfig, BridgeConfigBuilder, BridgeDirection, BrokerConfig,
    BrokerProfile, FramingConfig, ServerMode, ServiceConfig, TransportConfig,
};
pub use error::{BridgeError, Result};

// Re-exports for convenience - transports
pub use topic::{ChannelNameLookup, SharedChannelLookup, TopicMapper};
pub use transport::{
    build_transport, BrokerClient, BrokerMessage, BrokerTarget, BrokerTransport,
    ConnectionState, Listener, SerialTransport, SocketTransport, Transport, TransportStats,
};

#[cfg(feature = "mqtt")]
pub use transport::broker::RumqttClient;

// Re-exports for convenience - service
pub use service::{BridgeCommand, BridgeHandle, BridgeService, BridgeStats, PacketSink};

// Protocol constants re-exports
pub use config::{
    BRIDGE_PACKET_MAGIC, DEFAULT_BAUD_RATE, DEFAULT_MQTT_PORT, DEFAULT_RECONNECT_INTERVAL_MS,
    DEFAULT_SOCKET_PORT, DEFAULT_TOPIC_PREFIX, FRAME_QUEUE_SIZE, FRAME_REPLY_MARKER,
    FRAME_START_MARKER, MAX_FRAME_SIZE, MAX_PACKET_SIZE,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
