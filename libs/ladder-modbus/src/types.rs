//! Request table types
//!
//! A [`RequestTable`] is the master's fixed-capacity list of polling
//! requests. A slot with an empty target address is unused.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::constants::{
    MAX_REQUESTS, MAX_RTU_SLAVE_ID, MODBUS_ADDRESS_SPACE, MODBUS_MAX_READ_COILS,
    MODBUS_MAX_READ_REGISTERS, MODBUS_MAX_WRITE_COILS, MODBUS_MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};

/// Function performed by a request slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestKind {
    /// FC01
    #[default]
    ReadCoils,
    /// FC02
    ReadDiscreteInputs,
    /// FC03
    ReadHoldingRegisters,
    /// FC04
    ReadInputRegisters,
    /// FC05
    WriteSingleCoil,
    /// FC06
    WriteSingleRegister,
    /// FC08, sub-function 0 (return query data)
    Diagnostics,
    /// FC15
    WriteMultipleCoils,
    /// FC16
    WriteMultipleRegisters,
}

impl RequestKind {
    pub fn function_code(self) -> u8 {
        match self {
            RequestKind::ReadCoils => 0x01,
            RequestKind::ReadDiscreteInputs => 0x02,
            RequestKind::ReadHoldingRegisters => 0x03,
            RequestKind::ReadInputRegisters => 0x04,
            RequestKind::WriteSingleCoil => 0x05,
            RequestKind::WriteSingleRegister => 0x06,
            RequestKind::Diagnostics => 0x08,
            RequestKind::WriteMultipleCoils => 0x0F,
            RequestKind::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn from_function_code(fc: u8) -> Option<Self> {
        match fc {
            0x01 => Some(RequestKind::ReadCoils),
            0x02 => Some(RequestKind::ReadDiscreteInputs),
            0x03 => Some(RequestKind::ReadHoldingRegisters),
            0x04 => Some(RequestKind::ReadInputRegisters),
            0x05 => Some(RequestKind::WriteSingleCoil),
            0x06 => Some(RequestKind::WriteSingleRegister),
            0x08 => Some(RequestKind::Diagnostics),
            0x0F => Some(RequestKind::WriteMultipleCoils),
            0x10 => Some(RequestKind::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Coil/discrete-input requests (one bit per element)
    pub fn is_bit_access(self) -> bool {
        matches!(
            self,
            RequestKind::ReadCoils
                | RequestKind::ReadDiscreteInputs
                | RequestKind::WriteSingleCoil
                | RequestKind::WriteMultipleCoils
        )
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            RequestKind::ReadCoils
                | RequestKind::ReadDiscreteInputs
                | RequestKind::ReadHoldingRegisters
                | RequestKind::ReadInputRegisters
        )
    }

    /// Whether the element count of the slot goes on the wire
    pub fn uses_element_count(self) -> bool {
        self.is_read()
            || matches!(
                self,
                RequestKind::WriteMultipleCoils | RequestKind::WriteMultipleRegisters
            )
    }

    /// Protocol limit on the element count
    pub fn max_quantity(self) -> u16 {
        match self {
            RequestKind::ReadCoils | RequestKind::ReadDiscreteInputs => MODBUS_MAX_READ_COILS,
            RequestKind::ReadHoldingRegisters | RequestKind::ReadInputRegisters => {
                MODBUS_MAX_READ_REGISTERS
            },
            RequestKind::WriteMultipleCoils => MODBUS_MAX_WRITE_COILS,
            RequestKind::WriteMultipleRegisters => MODBUS_MAX_WRITE_REGISTERS,
            RequestKind::WriteSingleCoil
            | RequestKind::WriteSingleRegister
            | RequestKind::Diagnostics => 1,
        }
    }
}

impl TryFrom<u8> for RequestKind {
    type Error = String;

    fn try_from(fc: u8) -> Result<Self, Self::Error> {
        RequestKind::from_function_code(fc)
            .ok_or_else(|| format!("unsupported function code {}", fc))
    }
}

impl From<RequestKind> for u8 {
    fn from(kind: RequestKind) -> Self {
        kind.function_code()
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02}", self.function_code())
    }
}

/// One configured polling request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSlot {
    /// Numeric RTU slave id, or `host[:port]` in TCP mode; empty = unused
    pub target_address: String,
    pub function: RequestKind,
    /// First element, in the numbering selected by the element offset
    pub first_element: u32,
    pub element_count: u16,
    pub logic_inverted: bool,
    /// Index of the first mapped variable in the store
    pub variable_offset: usize,
}

impl Default for RequestSlot {
    fn default() -> Self {
        Self {
            target_address: String::new(),
            function: RequestKind::ReadCoils,
            first_element: 0,
            element_count: 1,
            logic_inverted: false,
            variable_offset: 0,
        }
    }
}

impl RequestSlot {
    pub fn is_used(&self) -> bool {
        !self.target_address.trim().is_empty()
    }

    /// Wire start address: first element minus the numbering offset, clamped at 0
    pub fn start_address(&self, element_offset: u16) -> ModbusResult<u16> {
        let address = self.first_element.saturating_sub(u32::from(element_offset));
        u16::try_from(address).map_err(|_| {
            ModbusError::config(format!(
                "first element {} is outside the 16-bit address space",
                self.first_element
            ))
        })
    }

    /// Element numbers transferred by this request
    pub fn elements(&self) -> ModbusResult<Range<u32>> {
        let end = self
            .first_element
            .checked_add(u32::from(self.quantity()))
            .ok_or_else(|| {
                ModbusError::config(format!(
                    "first element {} + {} elements overflows",
                    self.first_element,
                    self.quantity()
                ))
            })?;
        Ok(self.first_element..end)
    }

    /// Wire range and variable range both fit
    pub fn check_bounds(&self, element_offset: u16) -> ModbusResult<()> {
        let start = self.first_element.saturating_sub(u32::from(element_offset));
        let end = u64::from(start) + u64::from(self.quantity());
        if end > u64::from(MODBUS_ADDRESS_SPACE) {
            return Err(ModbusError::config(format!(
                "elements {}..{} exceed the 16-bit address space",
                start, end
            )));
        }
        if self
            .variable_offset
            .checked_add(usize::from(self.quantity()))
            .is_none()
        {
            return Err(ModbusError::config(format!(
                "variable offset {} overflows with {} elements",
                self.variable_offset,
                self.quantity()
            )));
        }
        Ok(())
    }

    /// Number of elements actually transferred by this request
    pub fn quantity(&self) -> u16 {
        if self.function.uses_element_count() {
            self.element_count
        } else {
            1
        }
    }
}

/// Parsed target of a request slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Rtu { slave: u8 },
    Tcp { host: String, port: u16 },
}

impl Target {
    /// RTU target: a decimal slave id in 0..=247
    pub fn parse_rtu(address: &str) -> ModbusResult<Self> {
        let slave: u8 = address.trim().parse().map_err(|_| {
            ModbusError::config(format!("invalid RTU slave address '{}'", address))
        })?;
        if slave > MAX_RTU_SLAVE_ID {
            return Err(ModbusError::config(format!(
                "RTU slave address {} out of range 0..={}",
                slave, MAX_RTU_SLAVE_ID
            )));
        }
        Ok(Target::Rtu { slave })
    }

    /// TCP target: `host[:port]`, IPv6 literals as `[addr]` or `[addr]:port`
    pub fn parse_tcp(address: &str, default_port: u16) -> ModbusResult<Self> {
        let address = address.trim();
        let parse_port = |port: &str| -> ModbusResult<u16> {
            port.parse().map_err(|_| {
                ModbusError::config(format!("invalid port in TCP address '{}'", address))
            })
        };

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                ModbusError::config(format!("unclosed '[' in TCP address '{}'", address))
            })?;
            let port = match tail {
                "" => default_port,
                _ => match tail.strip_prefix(':') {
                    Some(port) => parse_port(port)?,
                    None => {
                        return Err(ModbusError::config(format!(
                            "unexpected '{}' after ']' in TCP address '{}'",
                            tail, address
                        )))
                    },
                },
            };
            (host, port)
        } else {
            match address.split_once(':') {
                Some((_, port)) if port.contains(':') => {
                    return Err(ModbusError::config(format!(
                        "IPv6 address '{}' must be written as [addr] or [addr]:port",
                        address
                    )))
                },
                Some((host, port)) => (host, parse_port(port)?),
                None => (address, default_port),
            }
        };
        if host.is_empty() {
            return Err(ModbusError::config(format!(
                "missing host in TCP address '{}'",
                address
            )));
        }
        Ok(Target::Tcp {
            host: host.to_string(),
            port,
        })
    }

    pub fn endpoint(&self) -> String {
        match self {
            Target::Rtu { slave } => format!("slave {}", slave),
            Target::Tcp { host, port } if host.contains(':') => format!("[{}]:{}", host, port),
            Target::Tcp { host, port } => format!("{}:{}", host, port),
        }
    }
}

/// Fixed-capacity table of request slots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestTable {
    slots: Vec<RequestSlot>,
}

impl RequestTable {
    pub fn from_slots(slots: Vec<RequestSlot>) -> ModbusResult<Self> {
        if slots.len() > MAX_REQUESTS {
            return Err(ModbusError::config(format!(
                "{} requests configured, table holds {}",
                slots.len(),
                MAX_REQUESTS
            )));
        }
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RequestSlot> {
        self.slots.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestSlot> {
        self.slots.iter()
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_used()).count()
    }

    /// One lap over the occupied slots, starting at `start` and wrapping around
    pub fn occupied_from(&self, start: usize) -> impl Iterator<Item = usize> + '_ {
        let len = self.slots.len();
        (0..len)
            .map(move |step| (start + step) % len)
            .filter(move |&index| self.slots[index].is_used())
    }

    /// Occupied slot following `current`; `current` itself only when it is the sole one
    pub fn next_occupied_after(&self, current: usize) -> Option<usize> {
        self.occupied_from(current + 1).next()
    }

    /// Distinct target addresses referenced by occupied slots
    pub fn addresses(&self) -> Vec<&str> {
        let mut addresses: Vec<&str> = Vec::new();
        for slot in self.slots.iter().filter(|s| s.is_used()) {
            let address = slot.target_address.trim();
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        addresses
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn slot(address: &str) -> RequestSlot {
        RequestSlot {
            target_address: address.to_string(),
            ..RequestSlot::default()
        }
    }

    #[test]
    fn test_function_code_mapping() {
        for fc in [1u8, 2, 3, 4, 5, 6, 8, 15, 16] {
            let kind = RequestKind::from_function_code(fc).unwrap();
            assert_eq!(kind.function_code(), fc);
        }
        assert!(RequestKind::from_function_code(7).is_none());
        assert!(RequestKind::try_from(0x17).is_err());
    }

    #[test]
    fn test_start_address_clamped() {
        let mut s = slot("1");
        s.first_element = 0;
        assert_eq!(s.start_address(1).unwrap(), 0);
        s.first_element = 10;
        assert_eq!(s.start_address(1).unwrap(), 9);
        assert_eq!(s.start_address(0).unwrap(), 10);
        s.first_element = 70_000;
        assert!(matches!(s.start_address(0), Err(ModbusError::Config(_))));
    }

    #[test]
    fn test_element_range_and_bounds() {
        let mut s = slot("1");
        s.function = RequestKind::ReadHoldingRegisters;
        s.first_element = 65_535;
        s.element_count = 1;
        assert_eq!(s.elements().unwrap(), 65_535..65_536);
        assert!(s.check_bounds(0).is_ok());

        s.element_count = 2;
        assert!(s.check_bounds(0).is_err());
        // One-based numbering shifts the window by one
        s.first_element = 65_536;
        s.element_count = 1;
        assert!(s.check_bounds(1).is_ok());

        s.first_element = u32::MAX;
        assert!(s.elements().is_err());
        assert!(s.check_bounds(0).is_err());

        s.first_element = 0;
        s.variable_offset = usize::MAX;
        assert!(s.check_bounds(0).is_err());
    }

    #[test]
    fn test_circular_scan_skips_empty_slots() {
        let table =
            RequestTable::from_slots(vec![slot("1"), slot(""), slot("3"), slot("")]).unwrap();
        assert_eq!(table.occupied_from(0).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(table.occupied_from(1).collect::<Vec<_>>(), vec![2, 0]);
        assert_eq!(table.next_occupied_after(0), Some(2));
        assert_eq!(table.next_occupied_after(2), Some(0));
    }

    #[test]
    fn test_single_occupied_slot_wraps_to_itself() {
        let table = RequestTable::from_slots(vec![slot(""), slot("5")]).unwrap();
        assert_eq!(table.next_occupied_after(1), Some(1));
    }

    #[test]
    fn test_empty_table_has_no_occupied_slot() {
        let table = RequestTable::from_slots(vec![slot(""), slot(" ")]).unwrap();
        assert_eq!(table.occupied_from(0).next(), None);
        assert_eq!(table.next_occupied_after(0), None);
        assert_eq!(RequestTable::default().occupied_from(0).next(), None);
    }

    #[test]
    fn test_table_capacity_enforced() {
        let slots = vec![slot("1"); MAX_REQUESTS + 1];
        assert!(matches!(
            RequestTable::from_slots(slots),
            Err(ModbusError::Config(_))
        ));
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(Target::parse_rtu("5").unwrap(), Target::Rtu { slave: 5 });
        assert!(Target::parse_rtu("248").is_err());
        assert!(Target::parse_rtu("abc").is_err());

        assert_eq!(
            Target::parse_tcp("192.168.0.10", 502).unwrap(),
            Target::Tcp {
                host: "192.168.0.10".to_string(),
                port: 502
            }
        );
        assert_eq!(
            Target::parse_tcp("plc:1502", 502).unwrap().endpoint(),
            "plc:1502"
        );
        assert!(Target::parse_tcp(":502", 502).is_err());
        assert!(Target::parse_tcp("plc:http", 502).is_err());
    }

    #[test]
    fn test_ipv6_tcp_targets() {
        let target = Target::parse_tcp("[::1]:1502", 502).unwrap();
        assert_eq!(
            target,
            Target::Tcp {
                host: "::1".to_string(),
                port: 1502
            }
        );
        assert_eq!(target.endpoint(), "[::1]:1502");

        let target = Target::parse_tcp("[fe80::10]", 502).unwrap();
        assert_eq!(target.endpoint(), "[fe80::10]:502");

        // Bare IPv6 is ambiguous with host:port
        assert!(Target::parse_tcp("::1", 502).is_err());
        assert!(Target::parse_tcp("fe80::10:502", 502).is_err());
        assert!(Target::parse_tcp("[::1", 502).is_err());
        assert!(Target::parse_tcp("[::1]1502", 502).is_err());
        assert!(Target::parse_tcp("[]:502", 502).is_err());
    }

    #[test]
    fn test_distinct_addresses() {
        let table =
            RequestTable::from_slots(vec![slot("a:1"), slot("b:2"), slot("a:1"), slot("")])
                .unwrap();
        assert_eq!(table.addresses(), vec!["a:1", "b:2"]);
    }
}
