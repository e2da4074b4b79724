//! Transport framing
//!
//! RTU: `[address][PDU][crcLo][crcHi]`.
//! TCP: MBAP header `[trans:2][proto:2 = 0][len:2][unit:1]` followed by the PDU;
//! the length field counts the unit id plus the PDU.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::constants::{
    EXCEPTION_FLAG, EXCEPTION_PDU_LEN, MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MIN_MBAP_LENGTH,
    RTU_MIN_FRAME, RTU_OVERHEAD,
};
use crate::crc;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;

/// Framing selected once from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Serial line, address byte + CRC16
    Rtu,
    /// Modbus/TCP with MBAP header
    Tcp,
}

/// Wrap a PDU in RTU framing
pub fn encode_rtu(unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + RTU_OVERHEAD);
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    crc::append(&mut frame);
    frame
}

/// Unwrap a complete RTU frame addressed from `expected_unit`
pub fn decode_rtu(frame: &[u8], expected_unit: u8) -> ModbusResult<ModbusPdu> {
    if frame.len() < RTU_MIN_FRAME {
        return Err(ModbusError::framing(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    crc::verify(frame)?;
    if frame[0] != expected_unit {
        return Err(ModbusError::SlaveMismatch {
            expected: expected_unit,
            actual: frame[0],
        });
    }
    ModbusPdu::from_slice(&frame[1..frame.len() - 2])
}

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Unit id + PDU length
    pub length: u16,
    /// Unit identifier
    pub unit_id: u8,
}

impl MbapHeader {
    /// Bytes on the wire, unit id included
    pub const SIZE: usize = MBAP_HEADER_LEN + 1;

    pub fn for_pdu(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let [t_hi, t_lo] = self.transaction_id.to_be_bytes();
        let [p_hi, p_lo] = self.protocol_id.to_be_bytes();
        let [l_hi, l_lo] = self.length.to_be_bytes();
        [t_hi, t_lo, p_hi, p_lo, l_hi, l_lo, self.unit_id]
    }

    /// Parse and validate the first [`MbapHeader::SIZE`] bytes of `data`
    pub fn parse(data: &[u8]) -> ModbusResult<Self> {
        if data.len() < Self::SIZE {
            return Err(ModbusError::framing(format!(
                "MBAP header truncated: {} bytes",
                data.len()
            )));
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };
        if header.protocol_id != 0 {
            return Err(ModbusError::framing(format!(
                "invalid protocol id {}",
                header.protocol_id
            )));
        }
        let length = usize::from(header.length);
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ModbusError::framing(format!(
                "invalid MBAP length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// Number of PDU bytes following the header
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }
}

/// Wrap a PDU in an MBAP header
pub fn encode_tcp(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let header = MbapHeader::for_pdu(transaction_id, unit_id, pdu.len());
    let mut frame = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(pdu.as_slice());
    frame
}

/// Unwrap a complete MBAP frame answering transaction `expected_transaction`
pub fn decode_tcp(frame: &[u8], expected_transaction: u16) -> ModbusResult<(u8, ModbusPdu)> {
    let header = MbapHeader::parse(frame)?;
    if header.transaction_id != expected_transaction {
        return Err(ModbusError::TransactionMismatch {
            expected: expected_transaction,
            actual: header.transaction_id,
        });
    }
    let body = &frame[MbapHeader::SIZE..];
    if body.len() != header.pdu_len() {
        return Err(ModbusError::framing(format!(
            "MBAP length announces {} PDU bytes, frame carries {}",
            header.pdu_len(),
            body.len()
        )));
    }
    Ok((header.unit_id, ModbusPdu::from_slice(body)?))
}

/// Byte-count-driven reassembly of an RTU reply
///
/// RTU carries no length prefix, so the reader is told how many PDU bytes
/// a success reply holds. Bytes arriving before the expected slave address
/// are dropped as line noise; an exception function code shortens the
/// target to the fixed exception length.
#[derive(Debug)]
pub struct RtuReplyAssembler {
    unit_id: u8,
    target: usize,
    buf: Vec<u8>,
    noise: usize,
}

impl RtuReplyAssembler {
    pub fn new(unit_id: u8, expected_pdu_len: usize) -> Self {
        let target = expected_pdu_len + RTU_OVERHEAD;
        Self {
            unit_id,
            target,
            buf: Vec::with_capacity(target),
            noise: 0,
        }
    }

    /// Feed received bytes; returns how many were consumed
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let mut consumed = 0;
        for &byte in bytes {
            if self.is_complete() {
                break;
            }
            consumed += 1;
            if self.buf.is_empty() && byte != self.unit_id {
                self.noise += 1;
                continue;
            }
            self.buf.push(byte);
            if self.buf.len() == 2 && byte & EXCEPTION_FLAG != 0 {
                self.target = EXCEPTION_PDU_LEN + RTU_OVERHEAD;
            }
        }
        consumed
    }

    pub fn is_complete(&self) -> bool {
        self.buf.len() >= self.target
    }

    /// Bytes still missing for a complete frame
    pub fn remaining(&self) -> usize {
        self.target.saturating_sub(self.buf.len())
    }

    /// Bytes discarded as noise so far
    pub fn noise(&self) -> usize {
        self.noise
    }

    /// Received bytes, noise excluded
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Validate the assembled frame and return its PDU
    pub fn finish(&self) -> ModbusResult<ModbusPdu> {
        if !self.is_complete() {
            return Err(ModbusError::framing(format!(
                "RTU reply incomplete: {} of {} bytes",
                self.buf.len(),
                self.target
            )));
        }
        if self.noise > 0 {
            trace!("RTU reply: {} noise byte(s) discarded", self.noise);
        }
        decode_rtu(&self.buf, self.unit_id)
    }
}
