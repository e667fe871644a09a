//! Seam between the broker transport and a concrete MQTT client

use bytes::Bytes;
use std::time::Duration;

use crate::config::BrokerProfile;
use crate::error::Result;

/// Everything a client needs to open a broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    /// Broker hostname or IP address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Username; empty means anonymous
    pub username: String,
    /// Password
    pub password: String,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
}

impl BrokerTarget {
    /// Target for a configured profile
    pub fn from_profile(profile: &BrokerProfile, client_id: &str, keep_alive: Duration) -> Self {
        Self {
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            password: profile.password.clone(),
            client_id: client_id.to_string(),
            keep_alive,
        }
    }

    /// Credentials are only sent with a non-empty username
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

/// Minimal non-blocking MQTT client surface
///
/// Implementations must never block: `connect` starts an attempt and
/// `is_connected` reports the outcome on a later tick.
pub trait BrokerClient: Send {
    /// Point the client at a broker; takes effect on the next `connect`
    fn set_target(&mut self, target: BrokerTarget);

    /// Start a connection attempt against the current target
    fn connect(&mut self) -> Result<()>;

    /// Close the session
    fn disconnect(&mut self);

    /// True while the broker session is up
    fn is_connected(&self) -> bool;

    /// Subscribe to a topic at QoS 0
    fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Publish at QoS 0, not retained
    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()>;

    /// Next inbound message, if one is waiting
    fn poll_message(&mut self) -> Option<BrokerMessage>;
}
