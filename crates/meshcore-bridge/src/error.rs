//! Error types for transport bridge operations
//!
//! Framing and envelope errors are handled where they occur (the frame is
//! dropped and logged); connection errors drive the transport state machines.
//! Nothing here is fatal to the bridge.

use thiserror::Error;

/// Main error type for transport bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Framing Errors =====
    /// Payload exceeds the frame size limit
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Zero-length payloads are never framed
    #[error("Empty frame")]
    EmptyFrame,

    /// Outbound queue has no free slot
    #[error("Outbound queue full ({capacity} entries)")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
    },

    /// Declared frame length outside `[1, max]`
    #[error("Malformed frame length: {declared}")]
    MalformedLength {
        /// Length announced by the sender
        declared: usize,
    },

    // ===== Envelope Errors =====
    /// Envelope shorter than its header
    #[error("Envelope too short: {len} bytes")]
    TooShort {
        /// Received length
        len: usize,
    },

    /// Envelope magic does not match
    #[error("Invalid magic number: expected 0xC03E, got 0x{got:04X}")]
    InvalidMagic {
        /// The received magic number
        got: u16,
    },

    /// Envelope checksum does not match its payload
    #[error("Checksum mismatch: received 0x{received:04X}, calculated 0x{calculated:04X}")]
    ChecksumMismatch {
        /// Checksum carried by the envelope
        received: u16,
        /// Checksum computed over the payload
        calculated: u16,
    },

    // ===== Connection Errors =====
    /// Peer or broker session went away
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Connect attempt against a broker failed
    #[error("Broker {host}:{port} unreachable: {reason}")]
    BrokerUnreachable {
        /// Broker host
        host: String,
        /// Broker port
        port: u16,
        /// Failure reason
        reason: String,
    },

    /// Publish was refused by the broker client
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Target topic
        topic: String,
        /// Failure reason
        reason: String,
    },

    /// Transport is not connected
    #[error("Transport not connected")]
    NotConnected,

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not offered by this transport
    #[error("Operation not supported by {0}")]
    Unsupported(String),

    // ===== Service Errors =====
    /// Service already stopped
    #[error("Bridge service is not running")]
    ServiceStopped,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error is recoverable by the connection state machines
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionLost(_)
                | BridgeError::BrokerUnreachable { .. }
                | BridgeError::NotConnected
                | BridgeError::PublishFailed { .. }
        )
    }

    /// Check if this is a framing or envelope error (bad bytes, handled locally)
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            BridgeError::MalformedLength { .. }
                | BridgeError::TooShort { .. }
                | BridgeError::InvalidMagic { .. }
                | BridgeError::ChecksumMismatch { .. }
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            BridgeError::EmptyFrame => "EMPTY_FRAME",
            BridgeError::QueueFull { .. } => "QUEUE_FULL",
            BridgeError::MalformedLength { .. } => "MALFORMED_LENGTH",
            BridgeError::TooShort { .. } => "TOO_SHORT",
            BridgeError::InvalidMagic { .. } => "INVALID_MAGIC",
            BridgeError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            BridgeError::ConnectionLost(_) => "CONNECTION_LOST",
            BridgeError::BrokerUnreachable { .. } => "BROKER_UNREACHABLE",
            BridgeError::PublishFailed { .. } => "PUBLISH_FAILED",
            BridgeError::NotConnected => "NOT_CONNECTED",
            BridgeError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::Unsupported(_) => "UNSUPPORTED",
            BridgeError::ServiceStopped => "SERVICE_STOPPED",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
