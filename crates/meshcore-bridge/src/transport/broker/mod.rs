//! Broker transport
//!
//! Publishes every outbound packet, wrapped in a checksummed envelope, to a
//! topic derived from its channel. Holds two broker profiles and can switch
//! between them at runtime.
//!
//! `send_packet` only queues; each tick publishes at most one queued packet.
//! The queue smooths bursts within one session: whatever is still queued when
//! the session ends (loss, server switch, `end`) is discarded, never replayed.
//!
//! Connection handling is a clock-driven state machine: a connect attempt is
//! made in `begin`, and afterwards at most once per `reconnect_interval`
//! while the session is down. A tick never waits for the broker.

mod client;
#[cfg(feature = "mqtt")]
mod rumqtt;

pub use client::{BrokerClient, BrokerMessage, BrokerTarget};
#[cfg(feature = "mqtt")]
pub use rumqtt::RumqttClient;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::{ConnectionState, Transport, TransportStats};
use crate::clock::SharedClock;
use crate::config::{
    BridgeDirection, BrokerConfig, BrokerProfile, ServerMode, FRAME_QUEUE_SIZE, MAX_PACKET_SIZE,
};
use crate::envelope;
use crate::error::{BridgeError, Result};
use crate::queue::OutboundQueue;
use crate::topic::{SharedChannelLookup, TopicMapper};

/// Inbound messages examined per tick
const MAX_MESSAGES_PER_TICK: usize = 8;

/// Broker-backed transport with primary/secondary profiles
pub struct BrokerTransport<C: BrokerClient> {
    client: C,
    config: BrokerConfig,
    topics: TopicMapper,
    client_id: String,
    clock: SharedClock,
    channel_lookup: Option<SharedChannelLookup>,
    queue: OutboundQueue,
    initialized: bool,
    connected: bool,
    last_reconnect_attempt: Option<u64>,
    stats: TransportStats,
    name: String,
}

impl<C: BrokerClient> BrokerTransport<C> {
    /// Create a transport; no connection is made until `begin`
    pub fn new(mut client: C, config: BrokerConfig, clock: SharedClock) -> Result<Self> {
        if !config.primary.is_configured() {
            return Err(BridgeError::InvalidConfig(
                "primary broker host is empty".to_string(),
            ));
        }
        validate_index(&config, config.active_index)?;

        let client_id = config.resolved_client_id();
        let topics = TopicMapper::new(config.topic_prefix.clone());
        client.set_target(BrokerTarget::from_profile(
            config.active_profile(),
            &client_id,
            config.keep_alive,
        ));

        Ok(Self {
            client,
            name: format!("broker:{}", client_id),
            client_id,
            topics,
            config,
            clock,
            channel_lookup: None,
            queue: OutboundQueue::new(FRAME_QUEUE_SIZE, MAX_PACKET_SIZE),
            initialized: false,
            connected: false,
            last_reconnect_attempt: None,
            stats: TransportStats::default(),
        })
    }

    /// Attach the channel metadata used for topic names
    pub fn with_channel_lookup(mut self, lookup: SharedChannelLookup) -> Self {
        self.channel_lookup = Some(lookup);
        self
    }

    /// Host of the active profile
    pub fn active_broker(&self) -> &str {
        &self.config.active_profile().host
    }

    /// Port of the active profile
    pub fn active_port(&self) -> u16 {
        self.config.active_profile().port
    }

    /// Username of the active profile
    pub fn active_username(&self) -> &str {
        &self.config.active_profile().username
    }

    /// Password of the active profile
    pub fn active_password(&self) -> &str {
        &self.config.active_profile().password
    }

    /// Index of the active profile (0 = primary, 1 = secondary)
    pub fn active_server_index(&self) -> u8 {
        self.config.active_index
    }

    /// Client id presented to the broker
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Topic prefix
    pub fn topic_prefix(&self) -> &str {
        self.topics.prefix()
    }

    /// True while the broker session is up
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Packets waiting for the next tick
    pub fn queued_packets(&self) -> usize {
        self.queue.len()
    }

    /// Current configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Underlying client
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Make profile `index` active
    ///
    /// Disconnects from the current broker; the next tick connects to the new
    /// one without waiting for the backoff interval.
    pub fn switch_to_server(&mut self, index: u8) -> Result<()> {
        validate_index(&self.config, index)?;
        if index == self.config.active_index {
            return Ok(());
        }

        let previous = self.config.active_index;
        self.config.active_index = index;
        self.retarget();
        info!(
            from = previous,
            to = index,
            broker = %self.active_broker(),
            port = self.active_port(),
            "Switched broker profile"
        );
        Ok(())
    }

    /// Replace the secondary profile
    pub fn configure_secondary(&mut self, profile: BrokerProfile) -> Result<()> {
        if self.config.server_mode == ServerMode::SingleServer {
            return Err(BridgeError::InvalidConfig(
                "secondary broker requires dual-server mode".to_string(),
            ));
        }
        self.config.secondary = profile;
        if self.config.active_index == 1 {
            if !self.config.secondary.is_configured() {
                self.config.active_index = 0;
                warn!("Secondary broker cleared, falling back to primary");
            }
            self.retarget();
        }
        Ok(())
    }

    fn retarget(&mut self) {
        if self.connected || self.client.is_connected() {
            self.client.disconnect();
        }
        self.connected = false;
        self.discard_queued("server switch");
        self.client.set_target(BrokerTarget::from_profile(
            self.config.active_profile(),
            &self.client_id,
            self.config.keep_alive,
        ));
        self.last_reconnect_attempt = None;
    }

    fn attempt_connect(&mut self, now: u64) {
        self.last_reconnect_attempt = Some(now);
        self.stats.connect_attempts += 1;
        debug!(
            broker = %self.active_broker(),
            port = self.active_port(),
            attempt = self.stats.connect_attempts,
            "Connecting to broker"
        );

        match self.client.connect() {
            Ok(()) => {
                self.refresh_connection(now);
            }
            Err(e) => warn!(
                broker = %self.active_broker(),
                port = self.active_port(),
                error = %e,
                retry_ms = self.config.reconnect_interval.as_millis() as u64,
                "Broker connection failed"
            ),
        }
    }

    /// Track the client's session state; returns whether it is up
    fn refresh_connection(&mut self, now: u64) -> bool {
        let link_up = self.client.is_connected();

        if link_up && !self.connected {
            self.connected = true;
            info!(
                broker = %self.active_broker(),
                port = self.active_port(),
                client_id = %self.client_id,
                "Broker connected"
            );
            if self.config.direction == BridgeDirection::Bidirectional {
                let topic = self.topics.receive_topic();
                match self.client.subscribe(&topic) {
                    Ok(()) => info!(topic = %topic, "Subscribed for inbound packets"),
                    Err(e) => warn!(topic = %topic, error = %e, "Subscribe failed"),
                }
            }
        } else if !link_up && self.connected {
            self.connected = false;
            self.stats.connection_losses += 1;
            // Backoff counts from the moment the loss is noticed
            self.last_reconnect_attempt = Some(now);
            warn!(broker = %self.active_broker(), "Broker connection lost");
            self.discard_queued("connection lost");
        }

        self.connected
    }

    fn discard_queued(&mut self, reason: &str) {
        let dropped = self.queue.clear();
        if dropped > 0 {
            self.stats.frames_discarded += dropped as u64;
            debug!(dropped = dropped, reason = reason, "Discarded queued packets");
        }
    }

    /// Publish the oldest queued packet, if any
    fn publish_one(&mut self) {
        let Some(entry) = self.queue.dequeue_one() else {
            return;
        };
        let packet = entry.into_payload();
        let topic = self
            .topics
            .packet_topic(&packet, self.channel_lookup.as_deref());

        match self.client.publish(&topic, envelope::wrap(&packet)) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                debug!(topic = %topic, size = packet.len(), "Published packet");
            }
            Err(e) => {
                self.stats.frames_discarded += 1;
                warn!(topic = %topic, error = %e, "Publish failed, packet dropped");
            }
        }
    }

    fn reconnect_due(&self, now: u64) -> bool {
        match self.last_reconnect_attempt {
            None => true,
            Some(last) => {
                now.saturating_sub(last) >= self.config.reconnect_interval.as_millis() as u64
            }
        }
    }

    fn handle_message(&mut self, message: BrokerMessage) -> Option<Bytes> {
        if self.config.direction == BridgeDirection::SendOnly {
            self.stats.inbound_discarded += 1;
            debug!(
                topic = %message.topic,
                size = message.payload.len(),
                "Ignoring inbound message in send-only mode"
            );
            return None;
        }

        match envelope::unwrap(&message.payload) {
            Ok(packet) if packet.is_empty() || packet.len() > MAX_PACKET_SIZE => {
                self.stats.envelope_rejections += 1;
                debug!(topic = %message.topic, size = packet.len(), "Dropping envelope with unusable packet size");
                None
            }
            Ok(packet) => {
                self.stats.frames_received += 1;
                debug!(topic = %message.topic, size = packet.len(), "Received packet from broker");
                Some(packet)
            }
            Err(e) => {
                self.stats.envelope_rejections += 1;
                debug!(
                    topic = %message.topic,
                    code = e.error_code(),
                    error = %e,
                    "Dropping invalid envelope"
                );
                None
            }
        }
    }
}

fn validate_index(config: &BrokerConfig, index: u8) -> Result<()> {
    match index {
        0 => Ok(()),
        1 if config.server_mode == ServerMode::SingleServer => Err(BridgeError::InvalidConfig(
            "single-server mode has no secondary broker".to_string(),
        )),
        1 if !config.secondary.is_configured() => Err(BridgeError::InvalidConfig(
            "secondary broker is not configured".to_string(),
        )),
        1 => Ok(()),
        _ => Err(BridgeError::InvalidConfig(format!(
            "broker index {} out of range",
            index
        ))),
    }
}

impl<C: BrokerClient> Transport for BrokerTransport<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) -> Result<()> {
        self.initialized = true;
        info!(
            broker = %self.active_broker(),
            port = self.active_port(),
            prefix = %self.topics.prefix(),
            "Starting broker transport"
        );
        let now = self.clock.now_ms();
        self.attempt_connect(now);
        Ok(())
    }

    fn end(&mut self) {
        if self.connected || self.client.is_connected() {
            self.client.disconnect();
        }
        self.connected = false;
        self.initialized = false;
        self.last_reconnect_attempt = None;
        self.discard_queued("transport stopped");
        info!(broker = %self.active_broker(), "Broker transport stopped");
    }

    fn is_running(&self) -> bool {
        self.initialized && self.connected
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<usize> {
        if !self.connected || !self.client.is_connected() {
            self.stats.dropped_disconnected += 1;
            trace!(size = packet.len(), "Broker not connected, dropping packet");
            return Ok(0);
        }
        if packet.is_empty() {
            return Err(BridgeError::EmptyFrame);
        }

        match self.queue.enqueue(packet) {
            Ok(()) => Ok(packet.len()),
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

    fn poll(&mut self) -> Option<Bytes> {
        if !self.initialized {
            return None;
        }

        let now = self.clock.now_ms();
        if !self.refresh_connection(now) {
            if self.reconnect_due(now) {
                self.attempt_connect(now);
            }
            return None;
        }

        self.publish_one();

        for _ in 0..MAX_MESSAGES_PER_TICK {
            let message = self.client.poll_message()?;
            if let Some(packet) = self.handle_message(message) {
                return Some(packet);
            }
        }
        None
    }

    fn state(&self) -> ConnectionState {
        match (self.initialized, self.connected) {
            (false, _) => ConnectionState::Disabled,
            (true, true) => ConnectionState::Connected,
            (true, false) if self.last_reconnect_attempt.is_none() => ConnectionState::Connecting,
            (true, false) => ConnectionState::Disconnected,
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    fn switch_to_server(&mut self, index: u8) -> Result<()> {
        BrokerTransport::switch_to_server(self, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerProfile;
    use crate::packet::{header_byte, PayloadType, RouteType};
    use crate::test_utils::{ManualClock, MockBrokerClient};
    use std::sync::Arc;

    fn dual_config() -> BrokerConfig {
        BrokerConfig {
            primary: BrokerProfile::new("primary.local", 1883).with_credentials("alice", "pw1"),
            secondary: BrokerProfile::new("secondary.local", 8883),
            node_name: "Node".to_string(),
            ..BrokerConfig::default()
        }
    }

    fn setup(config: BrokerConfig) -> (BrokerTransport<MockBrokerClient>, MockBrokerClient, ManualClock) {
        let client = MockBrokerClient::new();
        let clock = ManualClock::new();
        let transport =
            BrokerTransport::new(client.clone(), config, Arc::new(clock.clone())).unwrap();
        (transport, client, clock)
    }

    fn group_packet(channel_hash: u8) -> Vec<u8> {
        vec![
            header_byte(PayloadType::GrpTxt, RouteType::Flood),
            0x00,
            channel_hash,
            0xAB,
        ]
    }

    #[test]
    fn test_begin_connects_and_targets_primary() {
        let (mut transport, client, _clock) = setup(dual_config());
        transport.begin().unwrap();

        assert!(transport.is_running());
        assert_eq!(client.connect_attempts(), 1);
        let target = client.current_target().unwrap();
        assert_eq!(target.host, "primary.local");
        assert_eq!(target.username, "alice");
        assert_eq!(target.client_id, "meshcore_4E6F64");
    }

    #[test]
    fn test_reconnect_pacing() {
        let (mut transport, client, clock) = setup(dual_config());
        transport.begin().unwrap();
        assert_eq!(client.connect_attempts(), 1);

        client.set_reachable(false);
        client.drop_connection();
        clock.set(0);
        assert!(transport.poll().is_none());
        assert!(!transport.is_running());

        clock.set(1000);
        transport.poll();
        clock.set(3000);
        transport.poll();
        assert_eq!(client.connect_attempts(), 1);

        clock.set(6000);
        transport.poll();
        assert_eq!(client.connect_attempts(), 2);
        transport.poll();
        assert_eq!(client.connect_attempts(), 2);
    }

    #[test]
    fn test_failed_begin_retries() {
        let (mut transport, client, clock) = setup(dual_config());
        client.set_reachable(false);
        transport.begin().unwrap();
        assert!(!transport.is_running());

        client.set_reachable(true);
        clock.set(4999);
        transport.poll();
        assert!(!transport.is_running());
        clock.set(5000);
        transport.poll();
        assert!(transport.is_running());
        assert_eq!(client.connect_attempts(), 2);
    }

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let (mut transport, client, _clock) = setup(dual_config());
        assert_eq!(transport.send_packet(&group_packet(0xD5)).unwrap(), 0);
        assert!(client.published().is_empty());
        assert_eq!(transport.stats().dropped_disconnected, 1);
    }

    #[test]
    fn test_publish_topic_and_envelope() {
        let (transport, client, _clock) = setup(dual_config());
        let lookup: SharedChannelLookup =
            Arc::new(|hash: u8| (hash == 0x01).then(|| "My Channel!".to_string()));
        let mut transport = transport.with_channel_lookup(lookup);
        transport.begin().unwrap();

        let packet = group_packet(0x01);
        assert_eq!(transport.send_packet(&packet).unwrap(), packet.len());
        transport.send_packet(&group_packet(0xD5)).unwrap();
        let advert = [header_byte(PayloadType::Advert, RouteType::Flood), 0x00, 0x42];
        transport.send_packet(&advert).unwrap();
        assert!(client.published().is_empty());

        // One publish per tick, in send order
        transport.poll();
        assert_eq!(client.published().len(), 1);
        transport.poll();
        transport.poll();
        assert_eq!(transport.queued_packets(), 0);
        assert_eq!(transport.stats().frames_sent, 3);

        let published = client.published();
        assert_eq!(published[0].topic, "meshcore/My_Channel");
        assert_eq!(published[1].topic, "meshcore/D5");
        assert_eq!(published[2].topic, "meshcore/all");
        assert_eq!(envelope::unwrap(&published[0].payload).unwrap().as_ref(), &packet[..]);
    }

    #[test]
    fn test_oversize_packet_rejected() {
        let (mut transport, _client, _clock) = setup(dual_config());
        transport.begin().unwrap();
        assert!(matches!(
            transport.send_packet(&[0x15; MAX_PACKET_SIZE + 1]),
            Err(BridgeError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_queue_full_rejects_newest() {
        let (mut transport, client, _clock) = setup(dual_config());
        transport.begin().unwrap();

        for hash in 0..FRAME_QUEUE_SIZE as u8 {
            transport.send_packet(&group_packet(hash)).unwrap();
        }
        assert!(matches!(
            transport.send_packet(&group_packet(0xEE)),
            Err(BridgeError::QueueFull { capacity: FRAME_QUEUE_SIZE })
        ));
        assert_eq!(transport.stats().queue_rejections, 1);

        for _ in 0..FRAME_QUEUE_SIZE + 1 {
            transport.poll();
        }
        let topics: Vec<String> = client.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["meshcore/00", "meshcore/01", "meshcore/02", "meshcore/03"]);
    }

    #[test]
    fn test_queued_packets_discarded_on_connection_loss() {
        let (mut transport, client, clock) = setup(dual_config());
        transport.begin().unwrap();
        transport.send_packet(&group_packet(0x01)).unwrap();
        transport.send_packet(&group_packet(0x02)).unwrap();

        client.drop_connection();
        clock.set(0);
        transport.poll();
        assert_eq!(transport.queued_packets(), 0);
        assert_eq!(transport.stats().frames_discarded, 2);

        // Nothing is replayed once the session is back
        clock.set(5000);
        transport.poll();
        assert!(transport.is_running());
        transport.poll();
        assert!(client.published().is_empty());
    }

    #[test]
    fn test_queued_packets_discarded_on_switch_and_end() {
        let (mut transport, client, _clock) = setup(dual_config());
        transport.begin().unwrap();
        transport.send_packet(&group_packet(0x01)).unwrap();
        transport.switch_to_server(1).unwrap();
        assert_eq!(transport.stats().frames_discarded, 1);

        transport.poll();
        assert!(transport.is_running());
        transport.send_packet(&group_packet(0x02)).unwrap();
        transport.end();
        assert_eq!(transport.stats().frames_discarded, 2);
        assert!(client.published().is_empty());
    }

    #[test]
    fn test_switch_to_server() {
        let (mut transport, client, _clock) = setup(dual_config());
        transport.begin().unwrap();

        transport.switch_to_server(1).unwrap();
        assert_eq!(transport.active_server_index(), 1);
        assert_eq!(transport.active_broker(), "secondary.local");
        assert_eq!(transport.active_port(), 8883);
        assert_eq!(transport.active_username(), "");
        assert!(!transport.is_running());
        assert_eq!(client.disconnects(), 1);

        // Next tick connects to the new broker without waiting
        transport.poll();
        assert!(transport.is_running());
        assert_eq!(client.current_target().unwrap().host, "secondary.local");
        assert_eq!(client.connect_attempts(), 2);
    }

    #[test]
    fn test_switch_to_same_server_is_noop() {
        let (mut transport, client, _clock) = setup(dual_config());
        transport.begin().unwrap();
        transport.switch_to_server(0).unwrap();
        assert!(transport.is_running());
        assert_eq!(client.disconnects(), 0);
    }

    #[test]
    fn test_switch_rejections() {
        let (mut transport, _client, _clock) = setup(BrokerConfig {
            secondary: BrokerProfile::default(),
            ..dual_config()
        });
        assert!(matches!(transport.switch_to_server(1), Err(BridgeError::InvalidConfig(_))));
        assert!(matches!(transport.switch_to_server(2), Err(BridgeError::InvalidConfig(_))));

        let (mut single, _client, _clock) = setup(BrokerConfig {
            server_mode: ServerMode::SingleServer,
            ..dual_config()
        });
        assert!(matches!(single.switch_to_server(1), Err(BridgeError::InvalidConfig(_))));
        assert!(single.configure_secondary(BrokerProfile::new("x", 1)).is_err());
    }

    #[test]
    fn test_configure_secondary_then_switch() {
        let (mut transport, client, _clock) = setup(BrokerConfig {
            secondary: BrokerProfile::default(),
            ..dual_config()
        });
        transport
            .configure_secondary(BrokerProfile::new("backup.local", 1884).with_credentials("bob", "pw2"))
            .unwrap();
        transport.switch_to_server(1).unwrap();
        assert_eq!(transport.active_password(), "pw2");
        assert_eq!(client.current_target().unwrap().port, 1884);
    }

    #[test]
    fn test_send_only_discards_inbound() {
        let (mut transport, client, _clock) = setup(dual_config());
        transport.begin().unwrap();
        assert!(client.subscriptions().is_empty());

        client.push_inbound("meshcore/rx", envelope::wrap(&[1, 2, 3]));
        assert!(transport.poll().is_none());
        assert_eq!(transport.stats().inbound_discarded, 1);
    }

    #[test]
    fn test_bidirectional_delivers_valid_envelopes() {
        let (mut transport, client, _clock) = setup(BrokerConfig {
            direction: BridgeDirection::Bidirectional,
            ..dual_config()
        });
        transport.begin().unwrap();
        assert_eq!(client.subscriptions(), vec!["meshcore/rx".to_string()]);

        let mut corrupted = envelope::wrap(&[9, 9, 9]).to_vec();
        corrupted[5] ^= 0x01;
        client.push_inbound("meshcore/rx", Bytes::from(corrupted));
        client.push_inbound("meshcore/rx", Bytes::from_static(&[0xC0]));
        client.push_inbound("meshcore/rx", envelope::wrap(&[1, 2, 3]));

        assert_eq!(transport.poll().unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(transport.stats().envelope_rejections, 2);
        assert_eq!(transport.stats().frames_received, 1);
    }

    #[test]
    fn test_resubscribe_after_reconnect() {
        let (mut transport, client, clock) = setup(BrokerConfig {
            direction: BridgeDirection::Bidirectional,
            ..dual_config()
        });
        transport.begin().unwrap();
        client.drop_connection();
        clock.set(0);
        transport.poll();
        clock.set(5000);
        transport.poll();
        assert!(transport.is_running());
        assert_eq!(client.subscriptions().len(), 2);
    }

    #[test]
    fn test_end_disconnects() {
        let (mut transport, client, _clock) = setup(dual_config());
        transport.begin().unwrap();
        transport.end();
        assert!(!transport.is_running());
        assert!(!client.is_connected());
        assert_eq!(transport.state(), ConnectionState::Disabled);
        assert!(transport.poll().is_none());
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let client = MockBrokerClient::new();
        let clock = Arc::new(ManualClock::new());
        let config = BrokerConfig {
            primary: BrokerProfile::default(),
            ..BrokerConfig::default()
        };
        assert!(BrokerTransport::new(client, config, clock).is_err());
    }
}
