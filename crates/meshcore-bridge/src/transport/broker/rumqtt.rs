//! [`BrokerClient`] backed by `rumqttc`
//!
//! `rumqttc` drives its connection from an async event loop. Each `connect`
//! spawns that loop on the current tokio runtime; the loop reports session
//! state through an atomic flag and forwards publishes through a channel, so
//! the synchronous transport tick only ever reads shared state.

use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::client::{BrokerClient, BrokerMessage, BrokerTarget};
use crate::error::{BridgeError, Result};

/// Request queue depth inside `rumqttc`
const REQUEST_CAPACITY: usize = 16;

/// Inbound messages buffered between ticks
const INBOUND_CAPACITY: usize = 64;

/// Smallest keep-alive `rumqttc` accepts
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(1);

/// `rumqttc` client with a background event loop
pub struct RumqttClient {
    target: Option<BrokerTarget>,
    client: Option<AsyncClient>,
    event_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    inbound_rx: Option<mpsc::Receiver<BrokerMessage>>,
}

impl RumqttClient {
    /// Create an idle client
    pub fn new() -> Self {
        Self {
            target: None,
            client: None,
            event_task: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound_rx: None,
        }
    }

    fn options(target: &BrokerTarget) -> MqttOptions {
        let mut options = MqttOptions::new(&target.client_id, &target.host, target.port);
        options.set_keep_alive(target.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        if target.has_credentials() {
            options.set_credentials(&target.username, &target.password);
        }
        options
    }

    fn teardown(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                trace!(error = %e, "Disconnect request not queued");
            }
        }
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.inbound_rx = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Default for RumqttClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl BrokerClient for RumqttClient {
    fn set_target(&mut self, target: BrokerTarget) {
        self.target = Some(target);
    }

    fn connect(&mut self) -> Result<()> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| BridgeError::InvalidConfig("broker target not set".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            BridgeError::BrokerUnreachable {
                host: target.host.clone(),
                port: target.port,
                reason: e.to_string(),
            }
        })?;

        self.teardown();

        let (client, mut event_loop) = AsyncClient::new(Self::options(&target), REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let connected = Arc::clone(&self.connected);
        let host = target.host.clone();

        let task = runtime.spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            debug!(broker = %host, "Broker accepted session");
                            connected.store(true, Ordering::SeqCst);
                        } else {
                            warn!(broker = %host, code = ?ack.code, "Broker refused session");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = BrokerMessage {
                            topic: publish.topic,
                            payload: publish.payload,
                        };
                        if inbound_tx.try_send(message).is_err() {
                            debug!(broker = %host, "Inbound buffer full, dropping message");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(broker = %host, error = %e, "Broker event loop ended");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        self.client = Some(client);
        self.event_task = Some(task);
        self.inbound_rx = Some(inbound_rx);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.teardown();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        let client = self.client.as_ref().ok_or(BridgeError::NotConnected)?;
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| BridgeError::ConnectionLost(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        let client = self.client.as_ref().ok_or(BridgeError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| BridgeError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn poll_message(&mut self) -> Option<BrokerMessage> {
        self.inbound_rx.as_mut()?.try_recv().ok()
    }
}
