//! Transport-independent PDU codec for the master side
//!
//! Builds the request PDU of a slot, parses the slave reply into the
//! variable store, and tells the RTU reader how long a reply will be.

use tracing::trace;

use crate::bridge::RequestBridge;
use crate::constants::{
    COIL_OFF, COIL_ON, DIAG_RETURN_QUERY_DATA, EXCEPTION_FLAG, EXCEPTION_PDU_LEN,
};
use crate::error::{ExceptionCode, ModbusError, ModbusResult};
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::types::{RequestKind, RequestSlot};

/// Number of bytes carrying `count` packed bits
#[inline]
pub fn bit_byte_count(count: u16) -> usize {
    usize::from(count).div_ceil(8)
}

/// Byte-count header of a read reply for `count` elements
pub fn read_byte_count(function: RequestKind, count: u16) -> usize {
    if function.is_bit_access() {
        bit_byte_count(count)
    } else {
        usize::from(count) * 2
    }
}

/// Pack values LSB-first, one bit per element
pub fn pack_bits(values: impl IntoIterator<Item = bool>) -> Vec<u8> {
    let mut packed = Vec::new();
    for (i, on) in values.into_iter().enumerate() {
        if i % 8 == 0 {
            packed.push(0);
        }
        if on {
            if let Some(byte) = packed.last_mut() {
                *byte |= 1 << (i % 8);
            }
        }
    }
    packed
}

/// Bit `index` of an LSB-first packed buffer
#[inline]
pub fn unpack_bit(packed: &[u8], index: usize) -> bool {
    packed
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

/// Build the request PDU for `slot`, reading write payloads through `bridge`
pub fn build_request(
    slot: &RequestSlot,
    element_offset: u16,
    bridge: &RequestBridge<'_>,
) -> ModbusResult<ModbusPdu> {
    slot.check_bounds(element_offset)?;
    let fc = slot.function.function_code();
    let start = slot.start_address(element_offset)?;
    let count = slot.element_count;

    let pdu = match slot.function {
        RequestKind::ReadCoils
        | RequestKind::ReadDiscreteInputs
        | RequestKind::ReadHoldingRegisters
        | RequestKind::ReadInputRegisters => PduBuilder::new()
            .function_code(fc)?
            .address(start)?
            .quantity(count)?
            .build(),
        RequestKind::WriteSingleCoil => {
            let value = if bridge.read_element(slot.first_element) != 0 {
                COIL_ON
            } else {
                COIL_OFF
            };
            PduBuilder::new()
                .function_code(fc)?
                .address(start)?
                .word(value)?
                .build()
        },
        RequestKind::WriteSingleRegister => {
            let value = bridge.read_element(slot.first_element) as u16;
            PduBuilder::new()
                .function_code(fc)?
                .address(start)?
                .word(value)?
                .build()
        },
        RequestKind::WriteMultipleCoils => {
            let packed = pack_bits(slot.elements()?.map(|element| bridge.read_element(element) != 0));
            PduBuilder::new()
                .function_code(fc)?
                .address(start)?
                .quantity(count)?
                .byte(packed.len() as u8)?
                .data(&packed)?
                .build()
        },
        RequestKind::WriteMultipleRegisters => {
            let mut builder = PduBuilder::new()
                .function_code(fc)?
                .address(start)?
                .quantity(count)?
                .byte((usize::from(count) * 2) as u8)?;
            for element in slot.elements()? {
                builder = builder.word(bridge.read_element(element) as u16)?;
            }
            builder.build()
        },
        RequestKind::Diagnostics => PduBuilder::new()
            .function_code(fc)?
            .word(DIAG_RETURN_QUERY_DATA)?
            .word(bridge.diagnostic_echo_word())?
            .build(),
    };
    Ok(pdu)
}

/// Length in bytes of the success PDU answering `slot`
///
/// RTU framing has no length prefix, so the serial reader waits for
/// exactly this many bytes (plus address and CRC).
pub fn expected_response_len(slot: &RequestSlot, function_code: u8) -> usize {
    if function_code & EXCEPTION_FLAG != 0 {
        return EXCEPTION_PDU_LEN;
    }
    match RequestKind::from_function_code(function_code) {
        Some(kind) if kind.is_read() => 2 + read_byte_count(kind, slot.element_count),
        // Writes echo address + value/quantity, diagnostics echo sub-code + data
        Some(_) => 5,
        None => EXCEPTION_PDU_LEN,
    }
}

/// Parse the reply PDU to the outstanding `slot`, storing read data through `bridge`
pub fn parse_response(
    sent_function_code: u8,
    slot: &RequestSlot,
    element_offset: u16,
    pdu: &ModbusPdu,
    bridge: &RequestBridge<'_>,
) -> ModbusResult<()> {
    let fc = pdu
        .function_code()
        .ok_or_else(|| ModbusError::framing("empty response PDU"))?;

    if fc & EXCEPTION_FLAG != 0 {
        let code = pdu.u8_at(1)?;
        return Err(ModbusError::Exception {
            function: fc & !EXCEPTION_FLAG,
            code: ExceptionCode::from_u8(code),
        });
    }
    if fc != sent_function_code {
        return Err(ModbusError::FunctionMismatch {
            expected: sent_function_code,
            actual: fc,
        });
    }

    let kind = RequestKind::from_function_code(fc)
        .ok_or_else(|| ModbusError::invalid_response(format!("unsupported FC{:02X}", fc)))?;
    slot.check_bounds(element_offset)?;
    let start = slot.start_address(element_offset)?;
    let count = slot.element_count;

    match kind {
        RequestKind::ReadCoils | RequestKind::ReadDiscreteInputs => {
            let data = read_payload(pdu, kind, count)?;
            for (i, element) in slot.elements()?.enumerate() {
                bridge.write_element(element, i32::from(unpack_bit(data, i)));
            }
        },
        RequestKind::ReadHoldingRegisters | RequestKind::ReadInputRegisters => {
            let data = read_payload(pdu, kind, count)?;
            for (element, word) in slot.elements()?.zip(data.chunks_exact(2)) {
                let value = u16::from_be_bytes([word[0], word[1]]);
                bridge.write_element(element, i32::from(value));
            }
        },
        RequestKind::WriteSingleCoil | RequestKind::WriteSingleRegister => {
            expect_len(pdu, 5)?;
            expect_echo("address", start, pdu.u16_at(1)?)?;
        },
        RequestKind::WriteMultipleCoils | RequestKind::WriteMultipleRegisters => {
            expect_len(pdu, 5)?;
            expect_echo("address", start, pdu.u16_at(1)?)?;
            expect_echo("quantity", count, pdu.u16_at(3)?)?;
        },
        RequestKind::Diagnostics => {
            expect_len(pdu, 5)?;
            expect_echo("sub-function", DIAG_RETURN_QUERY_DATA, pdu.u16_at(1)?)?;
            bridge.store_diagnostic_echo(pdu.u16_at(3)?);
        },
    }

    trace!(
        "Response accepted: FC={:02X}, start={}, count={}",
        fc,
        start,
        count
    );
    Ok(())
}

/// Validate the byte-count header of a read reply and return its data bytes
fn read_payload(pdu: &ModbusPdu, kind: RequestKind, count: u16) -> ModbusResult<&[u8]> {
    let expected = read_byte_count(kind, count);
    let byte_count = usize::from(pdu.u8_at(1)?);
    if byte_count != expected {
        return Err(ModbusError::invalid_response(format!(
            "byte count {} for {} elements, expected {}",
            byte_count, count, expected
        )));
    }
    expect_len(pdu, 2 + expected)?;
    Ok(&pdu.as_slice()[2..])
}

fn expect_len(pdu: &ModbusPdu, len: usize) -> ModbusResult<()> {
    if pdu.len() != len {
        return Err(ModbusError::framing(format!(
            "response PDU is {} bytes, expected {}",
            pdu.len(),
            len
        )));
    }
    Ok(())
}

fn expect_echo(field: &str, sent: u16, echoed: u16) -> ModbusResult<()> {
    if sent != echoed {
        return Err(ModbusError::invalid_response(format!(
            "echoed {} {} does not match request {}",
            field, echoed, sent
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bridge::{MemoryVariableStore, VarKind, VariableStore};
    use crate::config::MasterMap;

    fn slot(function: RequestKind, first: u32, count: u16) -> RequestSlot {
        RequestSlot {
            target_address: "1".to_string(),
            function,
            first_element: first,
            element_count: count,
            ..RequestSlot::default()
        }
    }

    fn pdu(bytes: &[u8]) -> ModbusPdu {
        ModbusPdu::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_build_read_request_applies_offset() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let s = slot(RequestKind::ReadHoldingRegisters, 108, 3);
        let bridge = RequestBridge::new(&s, &map, &store);
        let request = build_request(&s, 1, &bridge).unwrap();
        assert_eq!(request.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_build_single_coil_uses_sentinels() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let s = slot(RequestKind::WriteSingleCoil, 4, 1);
        let bridge = RequestBridge::new(&s, &map, &store);

        let off = build_request(&s, 0, &bridge).unwrap();
        assert_eq!(off.as_slice(), &[0x05, 0x00, 0x04, 0x00, 0x00]);

        store.write_variable(VarKind::MemBit, 0, 1);
        let on = build_request(&s, 0, &bridge).unwrap();
        assert_eq!(on.as_slice(), &[0x05, 0x00, 0x04, 0xFF, 0x00]);
    }

    #[test]
    fn test_build_multiple_coils_packs_lsb_first() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let mut s = slot(RequestKind::WriteMultipleCoils, 19, 10);
        s.variable_offset = 20;
        for (i, on) in [1, 0, 1, 1, 0, 0, 1, 1, 1, 0].iter().enumerate() {
            store.write_variable(VarKind::MemBit, 20 + i, *on);
        }
        let bridge = RequestBridge::new(&s, &map, &store);
        let request = build_request(&s, 0, &bridge).unwrap();
        // Reference example from the Modbus application protocol
        assert_eq!(
            request.as_slice(),
            &[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
    }

    #[test]
    fn test_build_multiple_registers() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        store.write_variable(VarKind::MemWord, 0, 0x000A);
        store.write_variable(VarKind::MemWord, 1, 0x0102);
        let s = slot(RequestKind::WriteMultipleRegisters, 1, 2);
        let bridge = RequestBridge::new(&s, &map, &store);
        let request = build_request(&s, 0, &bridge).unwrap();
        assert_eq!(
            request.as_slice(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_build_diagnostics_echo() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        store.write_variable(VarKind::MemWord, 0, 0xA537);
        let s = slot(RequestKind::Diagnostics, 0, 1);
        let bridge = RequestBridge::new(&s, &map, &store);
        let request = build_request(&s, 0, &bridge).unwrap();
        assert_eq!(request.as_slice(), &[0x08, 0x00, 0x00, 0xA5, 0x37]);
    }

    #[test]
    fn test_read_byte_count_formula() {
        for count in [1u16, 7, 8, 9, 16, 17, 2000] {
            assert_eq!(
                read_byte_count(RequestKind::ReadCoils, count),
                (usize::from(count) + 7) / 8
            );
            assert_eq!(
                read_byte_count(RequestKind::ReadInputRegisters, count),
                usize::from(count) * 2
            );
        }
    }

    #[test]
    fn test_expected_response_len() {
        let s = slot(RequestKind::ReadCoils, 0, 10);
        assert_eq!(expected_response_len(&s, 0x01), 4);
        let s = slot(RequestKind::ReadHoldingRegisters, 0, 2);
        assert_eq!(expected_response_len(&s, 0x03), 6);
        assert_eq!(expected_response_len(&s, 0x83), 2);
        assert_eq!(expected_response_len(&s, 0x10), 5);
        assert_eq!(expected_response_len(&s, 0x08), 5);
    }

    #[test]
    fn test_parse_register_read_big_endian() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let s = slot(RequestKind::ReadHoldingRegisters, 0, 3);
        let bridge = RequestBridge::new(&s, &map, &store);
        parse_response(
            0x03,
            &s,
            0,
            &pdu(&[0x03, 0x06, 0x00, 0x0A, 0x12, 0x34, 0xFF, 0xFF]),
            &bridge,
        )
        .unwrap();
        assert_eq!(
            &store.snapshot(VarKind::MemWord)[..3],
            &[0x000A, 0x1234, 0xFFFF]
        );
    }

    #[test]
    fn test_parse_bit_read_with_inverted_logic() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let mut s = slot(RequestKind::ReadDiscreteInputs, 0, 3);
        s.logic_inverted = true;
        let bridge = RequestBridge::new(&s, &map, &store);
        parse_response(0x02, &s, 0, &pdu(&[0x02, 0x01, 0b0000_0101]), &bridge).unwrap();
        assert_eq!(&store.snapshot(VarKind::MemBit)[..3], &[0, 1, 0]);
    }

    #[test]
    fn test_parse_rejects_bad_byte_count() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let s = slot(RequestKind::ReadHoldingRegisters, 0, 2);
        let bridge = RequestBridge::new(&s, &map, &store);
        let result = parse_response(0x03, &s, 0, &pdu(&[0x03, 0x02, 0x00, 0x01]), &bridge);
        assert!(matches!(result, Err(ModbusError::InvalidResponse(_))));
        // Nothing stored on failure
        assert_eq!(store.read_variable(VarKind::MemWord, 0), 0);
    }

    #[test]
    fn test_parse_exception_and_mismatch() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let s = slot(RequestKind::ReadHoldingRegisters, 0, 2);
        let bridge = RequestBridge::new(&s, &map, &store);

        let result = parse_response(0x03, &s, 0, &pdu(&[0x83, 0x02]), &bridge);
        assert_eq!(
            result,
            Err(ModbusError::Exception {
                function: 0x03,
                code: ExceptionCode::IllegalDataAddress
            })
        );

        let result = parse_response(0x03, &s, 0, &pdu(&[0x04, 0x00]), &bridge);
        assert!(matches!(result, Err(ModbusError::FunctionMismatch { .. })));
    }

    #[test]
    fn test_parse_write_echo_validation() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let s = slot(RequestKind::WriteMultipleRegisters, 1, 2);
        let bridge = RequestBridge::new(&s, &map, &store);

        assert!(parse_response(0x10, &s, 0, &pdu(&[0x10, 0x00, 0x01, 0x00, 0x02]), &bridge).is_ok());
        assert!(parse_response(0x10, &s, 0, &pdu(&[0x10, 0x00, 0x01, 0x00, 0x03]), &bridge).is_err());
        assert!(parse_response(0x10, &s, 0, &pdu(&[0x10, 0x00, 0x02, 0x00, 0x02]), &bridge).is_err());
    }

    #[test]
    fn test_parse_diagnostics_forwards_echo() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let mut s = slot(RequestKind::Diagnostics, 0, 1);
        s.variable_offset = 7;
        let bridge = RequestBridge::new(&s, &map, &store);
        parse_response(0x08, &s, 0, &pdu(&[0x08, 0x00, 0x00, 0x12, 0x34]), &bridge).unwrap();
        assert_eq!(store.read_variable(VarKind::MemWord, 7), 0x1234);

        let bad_sub = parse_response(0x08, &s, 0, &pdu(&[0x08, 0x00, 0x01, 0x12, 0x34]), &bridge);
        assert!(bad_sub.is_err());
    }

    #[test]
    fn test_pack_unpack_bits() {
        let packed = pack_bits([true, false, true, true, false, false, true, true, true, false]);
        assert_eq!(packed, vec![0xCD, 0x01]);
        assert!(unpack_bit(&packed, 8));
        assert!(!unpack_bit(&packed, 9));
        assert!(!unpack_bit(&packed, 64));
    }

    #[test]
    fn test_out_of_range_slot_rejected_before_store() {
        let store = MemoryVariableStore::default();
        let map = MasterMap::default();
        let s = slot(RequestKind::ReadCoils, u32::MAX, 2);
        let bridge = RequestBridge::new(&s, &map, &store);

        assert!(matches!(
            build_request(&s, 0, &bridge),
            Err(ModbusError::Config(_))
        ));
        let result = parse_response(0x01, &s, 0, &pdu(&[0x01, 0x01, 0x03]), &bridge);
        assert!(matches!(result, Err(ModbusError::Config(_))));
        assert!(store.snapshot(VarKind::MemBit).iter().all(|&v| v == 0));

        // Past the 16-bit wire address space instead of clamping to 0xFFFF
        let s = slot(RequestKind::ReadHoldingRegisters, 70_000, 2);
        let bridge = RequestBridge::new(&s, &map, &store);
        assert!(build_request(&s, 0, &bridge).is_err());
    }
}
