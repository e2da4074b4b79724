//! Ladder Controller Modbus Core
//!
//! Transport-independent pieces of the controller's Modbus stack: the
//! pieces that must match the wire byte for byte.
//!
//! # Modules
//!
//! - [`crc`] - CRC16 for RTU frames
//! - [`pdu`] - bounds-checked PDU buffer and builder
//! - [`codec`] - master request building and reply parsing
//! - [`frame`] - RTU and MBAP framing, RTU reply reassembly
//! - [`mbap_codec`] - `tokio_util` stream codec for Modbus/TCP
//! - [`bridge`] - element ↔ controller variable mapping
//! - [`slave`] - slave request dispatcher
//! - [`config`] / [`types`] - configuration and request table
//!
//! I/O, timing and the polling state machine live in the service crate.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod constants;
pub mod crc;
pub mod error;
pub mod frame;
pub mod mbap_codec;
pub mod pdu;
pub mod slave;
pub mod types;

pub use bridge::{MemoryVariableStore, RequestBridge, VarKind, VariableStore};
pub use config::{MasterMap, ModbusConfig, SerialParity, SlaveMap, VariableCounts};
pub use error::{ExceptionCode, ModbusError, ModbusResult};
pub use frame::{FramingMode, MbapHeader, RtuReplyAssembler};
pub use mbap_codec::{MbapCodec, MbapFrame};
pub use pdu::{ModbusPdu, PduBuilder};
pub use types::{RequestKind, RequestSlot, RequestTable, Target};
