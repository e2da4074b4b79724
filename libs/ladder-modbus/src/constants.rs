//! Modbus protocol constants

/// Maximum PDU size (function code + data), per the Modbus application protocol
pub const MAX_PDU_SIZE: usize = 253;

/// MBAP header length without the unit identifier (transaction + protocol + length)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum value of the MBAP length field: unit id (1) + PDU (253)
pub const MAX_MBAP_LENGTH: usize = 254;

/// Minimum value of the MBAP length field: unit id (1) + function code (1)
pub const MIN_MBAP_LENGTH: usize = 2;

/// RTU framing overhead: slave address (1) + CRC (2)
pub const RTU_OVERHEAD: usize = 3;

/// Smallest well-formed RTU frame: address + function code + CRC
pub const RTU_MIN_FRAME: usize = 4;

/// Length of an exception PDU: function code | 0x80 + exception code
pub const EXCEPTION_PDU_LEN: usize = 2;

/// Bit to set on a function code to mark an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Coil "on" sentinel for FC05
pub const COIL_ON: u16 = 0xFF00;

/// Coil "off" sentinel for FC05
pub const COIL_OFF: u16 = 0x0000;

/// Diagnostics sub-function "return query data"
pub const DIAG_RETURN_QUERY_DATA: u16 = 0x0000;

pub const MODBUS_MAX_READ_COILS: u16 = 2000;
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;
pub const MODBUS_MAX_WRITE_COILS: u16 = 1968;
pub const MODBUS_MAX_WRITE_REGISTERS: u16 = 123;

/// Number of addressable elements per table (16-bit wire address)
pub const MODBUS_ADDRESS_SPACE: u32 = 0x1_0000;

/// Capacity of the master request table
pub const MAX_REQUESTS: usize = 32;

/// Default Modbus/TCP port
pub const MODBUS_TCP_PORT: u16 = 502;

/// Highest addressable RTU slave id (0 is broadcast)
pub const MAX_RTU_SLAVE_ID: u8 = 247;
