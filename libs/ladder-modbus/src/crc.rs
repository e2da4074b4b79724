//! CRC16 for Modbus RTU frames
//!
//! Reflected polynomial 0xA001, initial value 0xFFFF. The checksum is
//! transmitted low byte first.

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus CRC16 of `data`
pub fn compute(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Append the CRC of the current frame content (low byte first)
pub fn append(frame: &mut Vec<u8>) {
    let crc = compute(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Verify the two trailing CRC bytes of a complete RTU frame
pub fn verify(frame: &[u8]) -> ModbusResult<()> {
    if frame.len() < 3 {
        return Err(ModbusError::framing(format!(
            "frame too short for CRC: {} bytes",
            frame.len()
        )));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = compute(body);
    if computed != received {
        return Err(ModbusError::Crc { computed, received });
    }
    Ok(())
}
