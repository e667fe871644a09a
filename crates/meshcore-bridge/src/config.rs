//! Configuration types for the transport bridge
//!
//! This module provides configuration structures for the byte-stream and
//! broker transports, the protocol constants they share, and a builder for
//! assembling a [`BridgeConfig`] in code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Largest payload carried by a single frame or envelope
pub const MAX_FRAME_SIZE: usize = 172;

/// Number of outbound frames a byte-stream transport will hold
pub const FRAME_QUEUE_SIZE: usize = 4;

/// Largest serialized mesh packet the engine produces
pub const MAX_PACKET_SIZE: usize = 255;

/// Start marker for frames sent by the client to the node (`'<'`)
pub const FRAME_START_MARKER: u8 = 0x3C;

/// Start marker for frames sent by the node back to the client (`'>'`)
pub const FRAME_REPLY_MARKER: u8 = 0x3E;

/// Magic number at the head of every bridge envelope
pub const BRIDGE_PACKET_MAGIC: u16 = 0xC03E;

/// Default TCP port for the companion socket
pub const DEFAULT_SOCKET_PORT: u16 = 5000;

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default topic prefix for published envelopes
pub const DEFAULT_TOPIC_PREFIX: &str = "meshcore/";

/// Default minimum spacing between broker connect attempts
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;

/// Default MQTT keep-alive
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;

/// Default baud rate for serial links
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default interval between transport ticks in [`crate::BridgeService`]
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

/// Main configuration for a bridge instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Which transport to run
    #[serde(default)]
    pub transport: TransportConfig,

    /// Frame and queue limits shared by the byte-stream transports
    #[serde(default)]
    pub framing: FramingConfig,

    /// Service driver settings
    #[serde(default)]
    pub service: ServiceConfig,
}

impl BridgeConfig {
    /// Reject settings the transports cannot honor
    pub fn validate(&self) -> Result<()> {
        self.framing.validate()?;
        self.service.validate()
    }
}

/// Transport selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Single-client TCP socket
    Socket {
        /// Address to bind, e.g. `0.0.0.0`
        #[serde(default = "default_bind_host")]
        host: String,
        /// Port to listen on
        #[serde(default = "default_socket_port")]
        port: u16,
    },
    /// Serial link
    Serial {
        /// Path to the serial device (e.g. /dev/ttyUSB0, COM3)
        port: PathBuf,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// Publish/subscribe broker
    Broker(BrokerConfig),
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_socket_port() -> u16 {
    DEFAULT_SOCKET_PORT
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Socket {
            host: default_bind_host(),
            port: DEFAULT_SOCKET_PORT,
        }
    }
}

/// Frame size and queue depth for byte-stream transports
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Largest accepted frame payload
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outbound queue capacity
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_queue_size() -> usize {
    FRAME_QUEUE_SIZE
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            queue_size: FRAME_QUEUE_SIZE,
        }
    }
}

impl FramingConfig {
    /// Frame lengths travel as a `u16`, so the limit must fit in one
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 || self.max_frame_size > u16::MAX as usize {
            return Err(BridgeError::InvalidConfig(format!(
                "max_frame_size {} outside 1..={}",
                self.max_frame_size,
                u16::MAX
            )));
        }
        if self.queue_size == 0 {
            return Err(BridgeError::InvalidConfig(
                "queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for the async service driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Interval between transport ticks
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,

    /// Capacity of the command channel behind [`crate::BridgeHandle`]
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(DEFAULT_TICK_INTERVAL_MS)
}

fn default_command_capacity() -> usize {
    256
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl ServiceConfig {
    /// A zero tick interval or command capacity is rejected
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "tick_interval must be non-zero".to_string(),
            ));
        }
        if self.command_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "command_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One broker endpoint with its credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerProfile {
    /// Broker hostname or IP address
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Username; credentials are only sent when this is non-empty
    #[serde(default)]
    pub username: String,

    /// Password
    #[serde(default)]
    pub password: String,
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

impl BrokerProfile {
    /// Create a profile without credentials
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    /// Attach credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Whether this profile names a broker at all
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }

    /// Whether the connect call should carry credentials
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// How many broker profiles may be used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// Only the primary profile is ever used
    SingleServer,
    /// Primary and secondary profiles, selectable at runtime
    #[default]
    DualServer,
}

/// Which directions the broker transport carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeDirection {
    /// Publish only; inbound messages are logged and dropped
    #[default]
    SendOnly,
    /// Publish and accept envelopes from the `rx` topic
    Bidirectional,
}

/// Broker transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Built-in profile (index 0)
    pub primary: BrokerProfile,

    /// Runtime-configurable profile (index 1)
    #[serde(default)]
    pub secondary: BrokerProfile,

    /// Which profile is in effect
    #[serde(default)]
    pub active_index: u8,

    /// Single or dual server operation
    #[serde(default)]
    pub server_mode: ServerMode,

    /// Send-only or bidirectional
    #[serde(default)]
    pub direction: BridgeDirection,

    /// Prefix prepended to every topic
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Explicit MQTT client id; derived from `node_name` when absent
    #[serde(default)]
    pub client_id: Option<String>,

    /// Node name used to derive the client id
    #[serde(default)]
    pub node_name: String,

    /// Minimum spacing between connect attempts
    #[serde(with = "humantime_serde", default = "default_reconnect_interval")]
    pub reconnect_interval: Duration,

    /// MQTT keep-alive
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_reconnect_interval() -> Duration {
    Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS)
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            primary: BrokerProfile::new("localhost", DEFAULT_MQTT_PORT),
            secondary: BrokerProfile::default(),
            active_index: 0,
            server_mode: ServerMode::DualServer,
            direction: BridgeDirection::SendOnly,
            topic_prefix: default_topic_prefix(),
            client_id: None,
            node_name: String::new(),
            reconnect_interval: default_reconnect_interval(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl BrokerConfig {
    /// Profile stored at `index`, if the index is valid
    pub fn profile(&self, index: u8) -> Option<&BrokerProfile> {
        match index {
            0 => Some(&self.primary),
            1 => Some(&self.secondary),
            _ => None,
        }
    }

    /// Profile currently in effect
    pub fn active_profile(&self) -> &BrokerProfile {
        match self.active_index {
            1 => &self.secondary,
            _ => &self.primary,
        }
    }

    /// Client id to present to the broker
    pub fn resolved_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| client_id_for(&self.node_name))
    }
}

/// Derive an MQTT client id from the first three bytes of the node name
///
/// Missing bytes are treated as zero, so an empty name yields `meshcore_000000`.
pub fn client_id_for(node_name: &str) -> String {
    let bytes = node_name.as_bytes();
    let byte = |i: usize| bytes.get(i).copied().unwrap_or(0);
    format!("meshcore_{:02X}{:02X}{:02X}", byte(0), byte(1), byte(2))
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a socket transport on the given port
    pub fn socket(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.transport = TransportConfig::Socket {
            host: host.into(),
            port,
        };
        self
    }

    /// Run a serial transport
    pub fn serial_port(mut self, port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        self.config.transport = TransportConfig::Serial {
            port: port.into(),
            baud_rate,
        };
        self
    }

    /// Run a broker transport against the given primary profile
    pub fn broker(mut self, primary: BrokerProfile) -> Self {
        let mut broker = match self.config.transport {
            TransportConfig::Broker(existing) => existing,
            _ => BrokerConfig::default(),
        };
        broker.primary = primary;
        self.config.transport = TransportConfig::Broker(broker);
        self
    }

    /// Set the secondary broker profile (only meaningful with a broker transport)
    pub fn secondary_broker(mut self, secondary: BrokerProfile) -> Self {
        if let TransportConfig::Broker(ref mut broker) = self.config.transport {
            broker.secondary = secondary;
        }
        self
    }

    /// Set the broker topic prefix
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        if let TransportConfig::Broker(ref mut broker) = self.config.transport {
            broker.topic_prefix = prefix.into();
        }
        self
    }

    /// Set the broker direction
    pub fn direction(mut self, direction: BridgeDirection) -> Self {
        if let TransportConfig::Broker(ref mut broker) = self.config.transport {
            broker.direction = direction;
        }
        self
    }

    /// Set the broker reconnect interval
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        if let TransportConfig::Broker(ref mut broker) = self.config.transport {
            broker.reconnect_interval = interval;
        }
        self
    }

    /// Set the maximum frame payload, clamped to `1..=u16::MAX`
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.framing.max_frame_size = size.clamp(1, u16::MAX as usize);
        self
    }

    /// Set the outbound queue capacity, clamped to at least one slot
    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.framing.queue_size = size.max(1);
        self
    }

    /// Set the service tick interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.service.tick_interval = interval;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.framing.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(config.framing.queue_size, FRAME_QUEUE_SIZE);
        assert!(matches!(
            config.transport,
            TransportConfig::Socket { port: DEFAULT_SOCKET_PORT, .. }
        ));
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfigBuilder::new()
            .broker(BrokerProfile::new("mqtt.example.org", 1883))
            .secondary_broker(BrokerProfile::new("10.0.0.2", 41883).with_credentials("u", "p"))
            .topic_prefix("mesh/")
            .direction(BridgeDirection::Bidirectional)
            .max_frame_size(200)
            .build();

        assert_eq!(config.framing.max_frame_size, 200);
        match config.transport {
            TransportConfig::Broker(broker) => {
                assert_eq!(broker.primary.host, "mqtt.example.org");
                assert_eq!(broker.secondary.port, 41883);
                assert!(broker.secondary.has_credentials());
                assert_eq!(broker.topic_prefix, "mesh/");
                assert_eq!(broker.direction, BridgeDirection::Bidirectional);
            }
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[test]
    fn test_client_id_from_node_name() {
        assert_eq!(client_id_for("ABC-node"), "meshcore_414243");
        assert_eq!(client_id_for("A"), "meshcore_410000");
        assert_eq!(client_id_for(""), "meshcore_000000");
    }

    #[test]
    fn test_active_profile_follows_index() {
        let mut config = BrokerConfig {
            secondary: BrokerProfile::new("backup", 1884),
            ..BrokerConfig::default()
        };
        assert_eq!(config.active_profile().host, "localhost");
        config.active_index = 1;
        assert_eq!(config.active_profile().host, "backup");
        assert!(config.profile(2).is_none());
    }

    #[test]
    fn test_broker_config_from_json() {
        let json = r#"{
            "type": "broker",
            "primary": { "host": "10.40.196.82", "port": 41883 },
            "reconnect_interval": "2s",
            "direction": "bidirectional"
        }"#;
        let transport: TransportConfig = serde_json::from_str(json).unwrap();
        match transport {
            TransportConfig::Broker(broker) => {
                assert_eq!(broker.primary.port, 41883);
                assert_eq!(broker.reconnect_interval, Duration::from_secs(2));
                assert_eq!(broker.topic_prefix, DEFAULT_TOPIC_PREFIX);
                assert_eq!(broker.server_mode, ServerMode::DualServer);
            }
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[test]
    fn test_size_clamping() {
        let config = BridgeConfigBuilder::new().max_frame_size(0).queue_size(0).build();
        assert_eq!(config.framing.max_frame_size, 1);
        assert_eq!(config.framing.queue_size, 1);
        assert!(config.validate().is_ok());

        let config = BridgeConfigBuilder::new().max_frame_size(70_000).build();
        assert_eq!(config.framing.max_frame_size, u16::MAX as usize);
    }

    #[test]
    fn test_validate_rejects_unframeable_sizes() {
        assert!(BridgeConfig::default().validate().is_ok());

        for (max_frame_size, queue_size) in [(0, 4), (70_000, 4), (65_536, 4), (172, 0)] {
            let mut config = BridgeConfig::default();
            config.framing = FramingConfig {
                max_frame_size,
                queue_size,
            };
            assert!(
                matches!(config.validate(), Err(BridgeError::InvalidConfig(_))),
                "accepted {} / {}",
                max_frame_size,
                queue_size
            );
        }

        let mut config = BridgeConfig::default();
        config.framing.max_frame_size = u16::MAX as usize;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let mut config = BridgeConfig::default();
        config.service.tick_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.service.command_capacity = 0;
        assert!(config.validate().is_err());
    }
}
