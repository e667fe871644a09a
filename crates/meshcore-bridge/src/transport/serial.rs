//! Framed transport over a serial link
//!
//! Same per-tick rules as the socket transport, without accept/replace: the
//! port is either open or it is gone.

use bytes::Bytes;
use std::io::{Read, Write};
use tracing::{debug, info, warn};

use super::link::{FramedLink, ReadOutcome};
use super::{ConnectionState, Transport, TransportStats};
use crate::config::FramingConfig;
use crate::error::{BridgeError, Result};

/// Framed transport over any non-blocking byte port
pub struct SerialTransport<P> {
    port: Option<P>,
    link: FramedLink,
    enabled: bool,
    name: String,
}

#[cfg(feature = "serial")]
impl SerialTransport<Box<dyn serialport::SerialPort>> {
    /// Open a serial device with a zero read timeout
    pub fn open(
        path: impl AsRef<std::path::Path>,
        baud_rate: u32,
        framing: &FramingConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();
        info!(port = %path, baud = baud_rate, "Opening serial port");

        let port = serialport::new(&path, baud_rate)
            .timeout(std::time::Duration::ZERO)
            .open()
            .map_err(|e| BridgeError::PortOpenFailed {
                port: path.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self::new(port, framing).with_name(format!("serial:{}", path)))
    }
}

impl<P: Read + Write + Send> SerialTransport<P> {
    /// Wrap an already-open port
    pub fn new(port: P, framing: &FramingConfig) -> Self {
        Self {
            port: Some(port),
            link: FramedLink::new(framing),
            enabled: false,
            name: "serial".to_string(),
        }
    }

    /// Override the name used in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// True while the port is open
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self, reason: &str) {
        if self.port.take().is_some() {
            let discarded = self.link.reset();
            self.link.stats.connection_losses += 1;
            warn!(
                transport = %self.name,
                reason = reason,
                discarded = discarded,
                "Serial port closed"
            );
        }
    }
}

impl<P: Read + Write + Send> Transport for SerialTransport<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) -> Result<()> {
        if self.port.is_none() {
            return Err(BridgeError::NotConnected);
        }
        self.link.reset();
        self.enabled = true;
        info!(transport = %self.name, "Serial transport enabled");
        Ok(())
    }

    fn end(&mut self) {
        self.link.reset();
        self.enabled = false;
        info!(transport = %self.name, "Serial transport disabled");
    }

    fn is_running(&self) -> bool {
        self.enabled && self.port.is_some()
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<usize> {
        let max = self.link.max_frame_size();
        if packet.len() > max {
            self.link.stats.oversized_rejections += 1;
            return Err(BridgeError::FrameTooLarge {
                size: packet.len(),
                max,
            });
        }
        if !self.is_running() {
            self.link.stats.dropped_disconnected += 1;
            return Ok(0);
        }
        self.link.queue_frame(packet)
    }

    fn poll(&mut self) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }
        let port = self.port.as_mut()?;

        if self.link.has_outbound() {
            if let Err(e) = self.link.write_one(port) {
                self.close(&e.to_string());
            }
            return None;
        }

        match self.link.read_frame(port) {
            Ok(ReadOutcome::Frame(frame)) => {
                debug!(transport = %self.name, size = frame.len(), "Received frame");
                Some(frame)
            }
            Ok(ReadOutcome::Idle) => None,
            Ok(ReadOutcome::Closed) => {
                self.close("end of stream");
                None
            }
            Err(e) => {
                self.close(&e.to_string());
                None
            }
        }
    }

    fn state(&self) -> ConnectionState {
        match (self.enabled, self.port.is_some()) {
            (false, _) => ConnectionState::Disabled,
            (true, true) => ConnectionState::Connected,
            (true, false) => ConnectionState::Disconnected,
        }
    }

    fn stats(&self) -> TransportStats {
        self.link.stats
    }
}
