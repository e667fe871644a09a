//! BridgeService - async driver for a transport
//!
//! Transports are synchronous and tick-driven. The service owns one
//! transport on a single tokio task, ticks it on an interval, hands inbound
//! packets to the mesh engine through a [`PacketSink`], and accepts outbound
//! packets and control commands through a cloneable [`BridgeHandle`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  BridgeCommand   ┌───────────────────────────┐
//! │ BridgeHandle │ ───────────────► │      BridgeService        │
//! │ (mesh engine)│   (mpsc)         │                           │
//! └──────────────┘                  │  interval ─► transport    │
//!        ▲                          │              .poll()      │
//!        │       PacketSink(Bytes)  │                 │         │
//!        └───────────────────────── │ ◄───────────────┘         │
//!                                   └───────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcore_bridge::{build_transport, BridgeConfig, BridgeService};
//! use std::sync::Arc;
//!
//! let config = BridgeConfig::default();
//! let transport = build_transport(&config)?;
//! let (service, handle) = BridgeService::new(
//!     transport,
//!     &config.service,
//!     Arc::new(|packet| println!("received {} bytes", packet.len())),
//! );
//! tokio::spawn(service.run());
//! handle.send_packet(packet).await?;
//! ```

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::ServiceConfig;
use crate::error::{BridgeError, Result};
use crate::transport::{ConnectionState, Transport, TransportStats};

/// Commands accepted by the service
#[derive(Debug)]
pub enum BridgeCommand {
    /// Hand a serialized packet to the transport
    SendPacket {
        /// Serialized mesh packet
        packet: Bytes,
        /// Where to report the outcome, if anyone is waiting
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
    /// Select a broker profile
    SwitchServer {
        /// Profile index
        index: u8,
        /// Outcome
        reply: oneshot::Sender<Result<()>>,
    },
    /// Get service statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Stop the service
    Shutdown,
}

/// Service statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Packets the transport accepted for sending
    pub packets_sent: u64,
    /// Packets dropped because the transport had no peer or session
    pub packets_dropped: u64,
    /// Packets the transport refused (oversize, queue full, publish failure)
    pub send_failures: u64,
    /// Inbound packets handed to the sink
    pub packets_received: u64,
    /// Transport ticks run
    pub ticks: u64,
    /// Whether the transport could deliver packets at snapshot time
    pub running: bool,
    /// Transport connection state at snapshot time
    pub state: Option<ConnectionState>,
    /// Transport counters
    pub transport: TransportStats,
}

/// Callback receiving every inbound packet
pub type PacketSink = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Handle for controlling a running [`BridgeService`]
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Send a packet and wait for the transport's verdict
    ///
    /// `Ok(0)` means the transport dropped it because nothing is connected.
    pub async fn send_packet(&self, packet: impl Into<Bytes>) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::SendPacket {
                packet: packet.into(),
                reply: Some(tx),
            })
            .await
            .map_err(|_| BridgeError::ServiceStopped)?;
        rx.await.map_err(|_| BridgeError::ServiceStopped)?
    }

    /// Queue a packet without waiting
    pub fn try_send_packet(&self, packet: impl Into<Bytes>) -> Result<()> {
        self.command_tx
            .try_send(BridgeCommand::SendPacket {
                packet: packet.into(),
                reply: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull {
                    capacity: self.command_tx.max_capacity(),
                },
                mpsc::error::TrySendError::Closed(_) => BridgeError::ServiceStopped,
            })
    }

    /// Select broker profile `index`
    pub async fn switch_server(&self, index: u8) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::SwitchServer { index, reply: tx })
            .await
            .map_err(|_| BridgeError::ServiceStopped)?;
        rx.await.map_err(|_| BridgeError::ServiceStopped)?
    }

    /// Get service statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| BridgeError::ServiceStopped)?;
        rx.await.map_err(|_| BridgeError::ServiceStopped)
    }

    /// Stop the service
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ServiceStopped)
    }
}

/// Drives one transport
pub struct BridgeService {
    transport: Box<dyn Transport>,
    sink: PacketSink,
    command_rx: mpsc::Receiver<BridgeCommand>,
    tick_interval: Duration,
    stats: BridgeStats,
}

impl BridgeService {
    /// Create a service and its handle
    pub fn new(
        transport: Box<dyn Transport>,
        config: &ServiceConfig,
        sink: PacketSink,
    ) -> (Self, BridgeHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let handle = BridgeHandle { command_tx };

        let service = Self {
            transport,
            sink,
            command_rx,
            tick_interval: config.tick_interval.max(Duration::from_millis(1)),
            stats: BridgeStats::default(),
        };

        (service, handle)
    }

    /// Run until shutdown or until every handle is dropped
    ///
    /// A failed `begin` is not fatal; the transport keeps retrying on its
    /// own schedule.
    pub async fn run(mut self) -> Result<()> {
        let name = self.transport.name().to_string();
        info!(transport = %name, tick_ms = self.tick_interval.as_millis() as u64, "Starting bridge service");

        if let Err(e) = self.transport.begin() {
            warn!(transport = %name, error = %e, "Transport failed to start, will keep ticking");
        }

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),

                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command) {
                                info!(transport = %name, "Bridge shutdown requested");
                                break;
                            }
                        }
                        None => {
                            debug!(transport = %name, "All bridge handles dropped");
                            break;
                        }
                    }
                }
            }
        }

        self.transport.end();
        info!(
            transport = %name,
            sent = self.stats.packets_sent,
            received = self.stats.packets_received,
            "Bridge service stopped"
        );
        Ok(())
    }

    fn tick(&mut self) {
        self.stats.ticks += 1;
        if let Some(packet) = self.transport.poll() {
            trace!(size = packet.len(), "Delivering inbound packet");
            self.stats.packets_received += 1;
            (self.sink)(packet);
        }
    }

    /// Returns false when the service should stop
    fn handle_command(&mut self, command: BridgeCommand) -> bool {
        match command {
            BridgeCommand::SendPacket { packet, reply } => {
                let result = self.transport.send_packet(&packet);
                match &result {
                    Ok(0) => self.stats.packets_dropped += 1,
                    Ok(_) => self.stats.packets_sent += 1,
                    Err(e) => {
                        self.stats.send_failures += 1;
                        debug!(code = e.error_code(), error = %e, "Transport refused packet");
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            BridgeCommand::SwitchServer { index, reply } => {
                let _ = reply.send(self.transport.switch_to_server(index));
            }
            BridgeCommand::GetStats(reply) => {
                let _ = reply.send(self.snapshot());
            }
            BridgeCommand::Shutdown => return false,
        }
        true
    }

    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            running: self.transport.is_running(),
            state: Some(self.transport.state()),
            transport: self.transport.stats(),
            ..self.stats.clone()
        }
    }
}
