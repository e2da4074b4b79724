//! Transport Layer Traits
//!
//! The master talks to its slaves through exactly one [`Transport`],
//! selected from configuration: a serial line (RTU) or a pool of TCP
//! connections (MBAP). Framing is done by the caller; a transport only
//! moves complete frames.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ladder_modbus::{FramingMode, Target};
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Every pool slot is held by another target
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Device not open yet
    #[error("Transport not ready: {0}")]
    NotReady(String),

    /// Target does not fit this transport
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError(err.to_string())
    }
}

/// Frame mover used by the master polling engine
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Framing the engine must apply to frames sent through this transport
    fn framing(&self) -> FramingMode;

    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Open the underlying device if needed
    ///
    /// A failure means the engine idles this cycle.
    async fn ensure_ready(&mut self) -> Result<(), TransportError>;

    /// Send one complete frame to `target`
    async fn send(&mut self, target: &Target, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait for one complete reply frame from `target`
    ///
    /// `expected_pdu_len` is the PDU length of a success reply; RTU
    /// uses it to know when the frame is complete.
    async fn receive(
        &mut self,
        target: &Target,
        expected_pdu_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Drop per-target resources whose target is not listed
    async fn retain_targets(&mut self, _targets: &[Target]) {}

    /// Release the underlying device
    async fn close(&mut self) {}
}
