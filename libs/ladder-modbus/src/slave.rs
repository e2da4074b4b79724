//! Slave-side request dispatcher
//!
//! Pure request → response mapping over the variable store. Every bound
//! violation produces an exception PDU; nothing here fails outright.

use tracing::debug;

use crate::bridge::{VarKind, VariableStore};
use crate::codec::{bit_byte_count, pack_bits, unpack_bit};
use crate::config::SlaveMap;
use crate::constants::{
    COIL_OFF, COIL_ON, DIAG_RETURN_QUERY_DATA, MODBUS_MAX_READ_COILS, MODBUS_MAX_READ_REGISTERS,
    MODBUS_MAX_WRITE_COILS, MODBUS_MAX_WRITE_REGISTERS,
};
use crate::error::ExceptionCode;
use crate::pdu::{ModbusPdu, PduBuilder};

type DispatchResult = Result<ModbusPdu, ExceptionCode>;

/// Answer one request PDU
pub fn handle_request(
    request: &ModbusPdu,
    store: &dyn VariableStore,
    map: &SlaveMap,
) -> ModbusPdu {
    let Some(fc) = request.function_code() else {
        return PduBuilder::exception(0, ExceptionCode::IllegalFunction.as_u8());
    };

    let result = match fc {
        0x01 => read_bits(request, store, map.coils),
        0x02 => read_bits(request, store, map.discrete_inputs),
        0x03 => read_words(request, store, map.holding_registers),
        0x04 => read_words(request, store, map.input_registers),
        0x05 => write_single_coil(request, store, map.coils),
        0x06 => write_single_register(request, store, map.holding_registers),
        0x08 => diagnostics(request),
        0x0F => write_multiple_coils(request, store, map.coils),
        0x10 => write_multiple_registers(request, store, map.holding_registers),
        _ => Err(ExceptionCode::IllegalFunction),
    };

    match result {
        Ok(response) => response,
        Err(code) => {
            debug!(
                "Slave exception: FC={:02X} ({}), code={}",
                fc,
                ModbusPdu::function_code_description(fc),
                code
            );
            PduBuilder::exception(fc, code.as_u8())
        },
    }
}

/// Start address and quantity of a fixed-length request
fn address_and_quantity(request: &ModbusPdu) -> Result<(u16, u16), ExceptionCode> {
    if request.len() != 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let address = request
        .u16_at(1)
        .map_err(|_| ExceptionCode::IllegalDataValue)?;
    let quantity = request
        .u16_at(3)
        .map_err(|_| ExceptionCode::IllegalDataValue)?;
    Ok((address, quantity))
}

fn check_quantity(quantity: u16, max: u16) -> Result<(), ExceptionCode> {
    if quantity == 0 || quantity > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

fn check_range(
    store: &dyn VariableStore,
    kind: VarKind,
    address: u16,
    quantity: u16,
) -> Result<(), ExceptionCode> {
    if usize::from(address) + usize::from(quantity) > store.capacity(kind) {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

fn build_failure<E>(_: E) -> ExceptionCode {
    ExceptionCode::SlaveDeviceFailure
}

fn read_bits(request: &ModbusPdu, store: &dyn VariableStore, kind: VarKind) -> DispatchResult {
    let (address, quantity) = address_and_quantity(request)?;
    check_quantity(quantity, MODBUS_MAX_READ_COILS)?;
    check_range(store, kind, address, quantity)?;

    let start = usize::from(address);
    let packed = pack_bits(
        (start..start + usize::from(quantity)).map(|i| store.read_variable(kind, i) != 0),
    );
    let fc = request.u8_at(0).map_err(build_failure)?;
    Ok(PduBuilder::new()
        .function_code(fc)
        .and_then(|b| b.byte(packed.len() as u8))
        .and_then(|b| b.data(&packed))
        .map_err(build_failure)?
        .build())
}

fn read_words(request: &ModbusPdu, store: &dyn VariableStore, kind: VarKind) -> DispatchResult {
    let (address, quantity) = address_and_quantity(request)?;
    check_quantity(quantity, MODBUS_MAX_READ_REGISTERS)?;
    check_range(store, kind, address, quantity)?;

    let fc = request.u8_at(0).map_err(build_failure)?;
    let mut response = ModbusPdu::new();
    response.push(fc).map_err(build_failure)?;
    response
        .push((usize::from(quantity) * 2) as u8)
        .map_err(build_failure)?;
    let start = usize::from(address);
    for i in start..start + usize::from(quantity) {
        response
            .push_u16(store.read_variable(kind, i) as u16)
            .map_err(build_failure)?;
    }
    Ok(response)
}

fn write_single_coil(
    request: &ModbusPdu,
    store: &dyn VariableStore,
    kind: VarKind,
) -> DispatchResult {
    let (address, value) = address_and_quantity(request)?;
    let on = match value {
        COIL_ON => true,
        COIL_OFF => false,
        _ => return Err(ExceptionCode::IllegalDataValue),
    };
    check_range(store, kind, address, 1)?;
    store.write_variable(kind, usize::from(address), i32::from(on));
    Ok(request.clone())
}

fn write_single_register(
    request: &ModbusPdu,
    store: &dyn VariableStore,
    kind: VarKind,
) -> DispatchResult {
    let (address, value) = address_and_quantity(request)?;
    check_range(store, kind, address, 1)?;
    store.write_variable(kind, usize::from(address), i32::from(value));
    Ok(request.clone())
}

fn diagnostics(request: &ModbusPdu) -> DispatchResult {
    let sub_function = request
        .u16_at(1)
        .map_err(|_| ExceptionCode::IllegalDataValue)?;
    if sub_function != DIAG_RETURN_QUERY_DATA {
        return Err(ExceptionCode::IllegalFunction);
    }
    // Return Query Data carries exactly one data word
    if request.len() != 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(request.clone())
}

/// Header of FC15/FC16: address, quantity, and the payload after the byte count
fn multiple_write_header(
    request: &ModbusPdu,
    max: u16,
    byte_count_for: fn(u16) -> usize,
) -> Result<(u16, u16, &[u8]), ExceptionCode> {
    if request.len() < 6 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let address = request
        .u16_at(1)
        .map_err(|_| ExceptionCode::IllegalDataValue)?;
    let quantity = request
        .u16_at(3)
        .map_err(|_| ExceptionCode::IllegalDataValue)?;
    check_quantity(quantity, max)?;

    let byte_count = usize::from(
        request
            .u8_at(5)
            .map_err(|_| ExceptionCode::IllegalDataValue)?,
    );
    if byte_count != byte_count_for(quantity) || request.len() != 6 + byte_count {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((address, quantity, &request.as_slice()[6..]))
}

fn write_echo(request: &ModbusPdu, address: u16, quantity: u16) -> DispatchResult {
    let fc = request.u8_at(0).map_err(build_failure)?;
    Ok(PduBuilder::new()
        .function_code(fc)
        .and_then(|b| b.address(address))
        .and_then(|b| b.quantity(quantity))
        .map_err(build_failure)?
        .build())
}

fn write_multiple_coils(
    request: &ModbusPdu,
    store: &dyn VariableStore,
    kind: VarKind,
) -> DispatchResult {
    let (address, quantity, payload) =
        multiple_write_header(request, MODBUS_MAX_WRITE_COILS, bit_byte_count)?;
    check_range(store, kind, address, quantity)?;

    for i in 0..usize::from(quantity) {
        let on = unpack_bit(payload, i);
        store.write_variable(kind, usize::from(address) + i, i32::from(on));
    }
    write_echo(request, address, quantity)
}

fn write_multiple_registers(
    request: &ModbusPdu,
    store: &dyn VariableStore,
    kind: VarKind,
) -> DispatchResult {
    let (address, quantity, payload) =
        multiple_write_header(request, MODBUS_MAX_WRITE_REGISTERS, |n| usize::from(n) * 2)?;
    check_range(store, kind, address, quantity)?;

    for (i, word) in payload.chunks_exact(2).enumerate() {
        let value = u16::from_be_bytes([word[0], word[1]]);
        store.write_variable(kind, usize::from(address) + i, i32::from(value));
    }
    write_echo(request, address, quantity)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bridge::MemoryVariableStore;
    use crate::config::VariableCounts;

    fn store() -> MemoryVariableStore {
        MemoryVariableStore::new(&VariableCounts {
            mem_bits: 4,
            mem_words: 10,
            phys_inputs: 16,
            phys_word_inputs: 4,
            ..VariableCounts::default()
        })
    }

    fn call(store: &MemoryVariableStore, bytes: &[u8]) -> Vec<u8> {
        let request = ModbusPdu::from_slice(bytes).unwrap();
        handle_request(&request, store, &SlaveMap::default())
            .as_slice()
            .to_vec()
    }

    #[test]
    fn test_read_coils_past_capacity() {
        let store = store();
        assert_eq!(call(&store, &[0x01, 0x00, 0x00, 0x00, 0x08]), vec![0x81, 0x02]);
    }

    #[test]
    fn test_read_boundary_at_capacity() {
        let store = store();
        store.write_variable(VarKind::MemBit, 3, 1);
        // Exactly at capacity succeeds
        assert_eq!(call(&store, &[0x01, 0x00, 0x00, 0x00, 0x04]), vec![0x01, 0x01, 0x08]);
        // One past capacity
        assert_eq!(call(&store, &[0x01, 0x00, 0x01, 0x00, 0x04]), vec![0x81, 0x02]);

        assert_eq!(call(&store, &[0x03, 0x00, 0x09, 0x00, 0x01]), vec![0x03, 0x02, 0x00, 0x00]);
        assert_eq!(call(&store, &[0x03, 0x00, 0x09, 0x00, 0x02]), vec![0x83, 0x02]);
    }

    #[test]
    fn test_read_is_idempotent() {
        let store = store();
        store.write_variable(VarKind::PhysWordInput, 1, 0x1234);
        let first = call(&store, &[0x04, 0x00, 0x00, 0x00, 0x03]);
        let second = call(&store, &[0x04, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(first, vec![0x04, 0x06, 0x00, 0x00, 0x12, 0x34, 0x00, 0x00]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_quantity_checked_before_range() {
        let store = store();
        assert_eq!(call(&store, &[0x02, 0x00, 0x00, 0x00, 0x00]), vec![0x82, 0x03]);
        assert_eq!(call(&store, &[0x03, 0x00, 0x00, 0x00, 0x7E]), vec![0x83, 0x03]);
        assert_eq!(call(&store, &[0x03, 0x00, 0x00]), vec![0x83, 0x03]);
    }

    #[test]
    fn test_unsupported_function() {
        let store = store();
        assert_eq!(call(&store, &[0x2B, 0x0E, 0x01, 0x00]), vec![0xAB, 0x01]);
        assert_eq!(call(&store, &[0x07]), vec![0x87, 0x01]);
    }

    #[test]
    fn test_write_single_coil_and_register() {
        let store = store();
        let request = [0x05, 0x00, 0x02, 0xFF, 0x00];
        assert_eq!(call(&store, &request), request.to_vec());
        assert_eq!(store.read_variable(VarKind::MemBit, 2), 1);

        assert_eq!(call(&store, &[0x05, 0x00, 0x02, 0x12, 0x34]), vec![0x85, 0x03]);
        assert_eq!(call(&store, &[0x05, 0x00, 0x04, 0x00, 0x00]), vec![0x85, 0x02]);

        let request = [0x06, 0x00, 0x01, 0xAB, 0xCD];
        assert_eq!(call(&store, &request), request.to_vec());
        assert_eq!(store.read_variable(VarKind::MemWord, 1), 0xABCD);
    }

    #[test]
    fn test_write_multiple() {
        let store = store();
        let response = call(&store, &[0x0F, 0x00, 0x00, 0x00, 0x03, 0x01, 0b0000_0101]);
        assert_eq!(response, vec![0x0F, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(&store.snapshot(VarKind::MemBit)[..3], &[1, 0, 1]);

        let response = call(
            &store,
            &[0x10, 0x00, 0x08, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
        );
        assert_eq!(response, vec![0x10, 0x00, 0x08, 0x00, 0x02]);
        assert_eq!(&store.snapshot(VarKind::MemWord)[8..], &[0x0A, 0x0102]);

        // Byte count disagrees with quantity
        let response = call(&store, &[0x10, 0x00, 0x00, 0x00, 0x02, 0x02, 0x00, 0x0A]);
        assert_eq!(response, vec![0x90, 0x03]);
        // Range past capacity
        let response = call(
            &store,
            &[0x10, 0x00, 0x09, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
        );
        assert_eq!(response, vec![0x90, 0x02]);
    }

    #[test]
    fn test_diagnostics_echo() {
        let store = store();
        let request = [0x08, 0x00, 0x00, 0xA5, 0x37];
        assert_eq!(call(&store, &request), request.to_vec());
        assert_eq!(call(&store, &[0x08, 0x00, 0x0A, 0x00, 0x00]), vec![0x88, 0x01]);
    }

    #[test]
    fn test_diagnostics_requires_one_data_word() {
        let store = store();
        assert_eq!(call(&store, &[0x08, 0x00, 0x00]), vec![0x88, 0x03]);
        assert_eq!(call(&store, &[0x08, 0x00, 0x00, 0xA5]), vec![0x88, 0x03]);
        assert_eq!(
            call(&store, &[0x08, 0x00, 0x00, 0xA5, 0x37, 0x01]),
            vec![0x88, 0x03]
        );
        assert_eq!(call(&store, &[0x08, 0x00]), vec![0x88, 0x03]);
    }
}
