//! Modbus Error Types
//!
//! Errors are grouped the way the master reacts to them: framing errors
//! discard the reply, protocol errors come from the slave itself, and
//! configuration errors are raised at load time.

use std::fmt;

use thiserror::Error;

/// Result type for ladder-modbus operations
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Modbus exception codes carried in `[fc | 0x80][code]` replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    /// Any code not defined by the protocol
    Other(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailed,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::SlaveDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::SlaveDeviceBusy => 0x06,
            Self::NegativeAcknowledge => 0x07,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailed => 0x0B,
            Self::Other(code) => code,
        }
    }

    /// Get exception description
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::SlaveDeviceFailure => "Slave Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::SlaveDeviceBusy => "Slave Device Busy",
            Self::NegativeAcknowledge => "Negative Acknowledge",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetFailed => "Gateway Target Device Failed to Respond",
            Self::Other(_) => "Unknown Exception",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} ({})", self.as_u8(), self.description())
    }
}

/// Modbus protocol errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModbusError {
    /// Malformed frame (length, header fields, truncated data)
    #[error("Framing error: {0}")]
    Framing(String),

    /// RTU checksum does not match the received frame
    #[error("CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    Crc { computed: u16, received: u16 },

    /// MBAP transaction id does not belong to the outstanding request
    #[error("Transaction id mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// Reply came from another slave than the one addressed
    #[error("Slave address mismatch: expected {expected}, got {actual}")]
    SlaveMismatch { expected: u8, actual: u8 },

    /// Slave answered with an exception PDU
    #[error("Slave exception on FC{function:02}: {code}")]
    Exception { function: u8, code: ExceptionCode },

    /// Reply function code differs from the request
    #[error("Function code mismatch: expected {expected:02X}, got {actual:02X}")]
    FunctionMismatch { expected: u8, actual: u8 },

    /// Reply is well framed but its content does not match the request
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// PDU buffer capacity exceeded
    #[error("PDU overflow: {0}")]
    Overflow(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors (stream codecs)
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Io(err.to_string())
    }
}

impl ModbusError {
    pub fn framing(msg: impl Into<String>) -> Self {
        ModbusError::Framing(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        ModbusError::InvalidResponse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config(msg.into())
    }

    /// Reply discarded before its content was interpreted
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ModbusError::Framing(_)
                | ModbusError::Crc { .. }
                | ModbusError::TransactionMismatch { .. }
                | ModbusError::SlaveMismatch { .. }
        )
    }

    /// Slave-side refusal or a reply that does not answer the request
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ModbusError::Exception { .. }
                | ModbusError::FunctionMismatch { .. }
                | ModbusError::InvalidResponse(_)
        )
    }
}
