//! Error handling for the Modbus service

use ladder_modbus::ModbusError;
use thiserror::Error;

use crate::transport::TransportError;

/// Modbus service error type
#[derive(Error, Debug, Clone)]
pub enum SrvError {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Serial or TCP transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Modbus protocol errors
    #[error("Protocol error: {0}")]
    Protocol(ModbusError),

    /// Logging setup errors
    #[error("Logging error: {0}")]
    LoggingError(String),
}

/// Result type alias for the Modbus service
pub type Result<T> = std::result::Result<T, SrvError>;

impl SrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        SrvError::ConfigError(msg.into())
    }
}

impl From<ModbusError> for SrvError {
    fn from(err: ModbusError) -> Self {
        match err {
            ModbusError::Config(msg) => SrvError::ConfigError(msg),
            other => SrvError::Protocol(other),
        }
    }
}

impl From<std::io::Error> for SrvError {
    fn from(err: std::io::Error) -> Self {
        SrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for SrvError {
    fn from(err: figment::Error) -> Self {
        SrvError::ConfigError(err.to_string())
    }
}
