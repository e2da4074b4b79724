//! MBAP stream codec for `tokio_util::codec::Framed`

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::MbapHeader;
use crate::pdu::ModbusPdu;

/// One MBAP-framed Modbus/TCP message
#[derive(Debug, Clone)]
pub struct MbapFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

impl MbapFrame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }

    /// Frame answering `self` with `pdu`, echoing transaction and unit ids
    pub fn reply(&self, pdu: ModbusPdu) -> Self {
        Self::new(self.transaction_id, self.unit_id, pdu)
    }
}

/// Splits a byte stream into [`MbapFrame`]s using the MBAP length field
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = MbapFrame;
    type Error = ModbusError;

    fn decode(&mut self, src: &mut BytesMut) -> ModbusResult<Option<MbapFrame>> {
        if src.len() < MbapHeader::SIZE {
            return Ok(None);
        }
        let header = MbapHeader::parse(&src[..MbapHeader::SIZE])?;
        let frame_len = MbapHeader::SIZE + header.pdu_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(MbapHeader::SIZE);
        let body = src.split_to(header.pdu_len());
        Ok(Some(MbapFrame {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            pdu: ModbusPdu::from_slice(&body)?,
        }))
    }
}

impl Encoder<MbapFrame> for MbapCodec {
    type Error = ModbusError;

    fn encode(&mut self, frame: MbapFrame, dst: &mut BytesMut) -> ModbusResult<()> {
        let header = MbapHeader::for_pdu(frame.transaction_id, frame.unit_id, frame.pdu.len());
        dst.reserve(MbapHeader::SIZE + frame.pdu.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(frame.pdu.as_slice());
        Ok(())
    }
}
