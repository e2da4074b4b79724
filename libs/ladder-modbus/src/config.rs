//! Modbus configuration types
//!
//! Deserialized by the service from YAML/TOML/environment; every struct is
//! `#[serde(default)]` so a partial file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::VarKind;
use crate::constants::{MAX_REQUESTS, MODBUS_TCP_PORT};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::FramingMode;
use crate::types::{RequestKind, RequestTable, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

/// Variable areas the master reads into / writes from, per function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterMap {
    /// FC02 destination
    pub read_inputs: VarKind,
    /// FC01 destination
    pub read_coils: VarKind,
    /// FC05/FC15 source
    pub write_coils: VarKind,
    /// FC04 destination
    pub read_input_regs: VarKind,
    /// FC03 destination (and FC08 echo destination)
    pub read_hold_regs: VarKind,
    /// FC06/FC16 source (and FC08 echo source)
    pub write_hold_regs: VarKind,
}

impl Default for MasterMap {
    fn default() -> Self {
        Self {
            read_inputs: VarKind::MemBit,
            read_coils: VarKind::MemBit,
            write_coils: VarKind::MemBit,
            read_input_regs: VarKind::MemWord,
            read_hold_regs: VarKind::MemWord,
            write_hold_regs: VarKind::MemWord,
        }
    }
}

impl MasterMap {
    pub fn kind_for(&self, function: RequestKind) -> VarKind {
        match function {
            RequestKind::ReadCoils => self.read_coils,
            RequestKind::ReadDiscreteInputs => self.read_inputs,
            RequestKind::ReadHoldingRegisters | RequestKind::Diagnostics => self.read_hold_regs,
            RequestKind::ReadInputRegisters => self.read_input_regs,
            RequestKind::WriteSingleCoil | RequestKind::WriteMultipleCoils => self.write_coils,
            RequestKind::WriteSingleRegister | RequestKind::WriteMultipleRegisters => {
                self.write_hold_regs
            },
        }
    }
}

/// Variable areas the slave exposes to remote masters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveMap {
    /// FC01/FC05/FC15
    pub coils: VarKind,
    /// FC02
    pub discrete_inputs: VarKind,
    /// FC04
    pub input_registers: VarKind,
    /// FC03/FC06/FC16
    pub holding_registers: VarKind,
}

impl Default for SlaveMap {
    fn default() -> Self {
        Self {
            coils: VarKind::MemBit,
            discrete_inputs: VarKind::PhysInput,
            input_registers: VarKind::PhysWordInput,
            holding_registers: VarKind::MemWord,
        }
    }
}

/// Sizes of the controller variable areas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariableCounts {
    pub mem_bits: usize,
    pub mem_words: usize,
    pub phys_inputs: usize,
    pub phys_outputs: usize,
    pub phys_word_inputs: usize,
    pub phys_word_outputs: usize,
}

impl Default for VariableCounts {
    fn default() -> Self {
        Self {
            mem_bits: 100,
            mem_words: 100,
            phys_inputs: 50,
            phys_outputs: 50,
            phys_word_inputs: 25,
            phys_word_outputs: 25,
        }
    }
}

impl VariableCounts {
    pub fn count(&self, kind: VarKind) -> usize {
        match kind {
            VarKind::MemBit => self.mem_bits,
            VarKind::MemWord => self.mem_words,
            VarKind::PhysInput => self.phys_inputs,
            VarKind::PhysOutput => self.phys_outputs,
            VarKind::PhysWordInput => self.phys_word_inputs,
            VarKind::PhysWordOutput => self.phys_word_outputs,
        }
    }
}

/// Global Modbus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Serial device; empty selects Modbus/TCP
    pub serial_port: String,
    pub serial_speed: u32,
    pub serial_data_bits: u8,
    pub serial_parity: SerialParity,
    pub serial_stop_bits: u8,
    /// Raise RTS while transmitting (RS-485 direction control)
    pub serial_use_rts_to_send: bool,
    /// Element numbering of the request table: 0 or 1
    pub element_offset: u16,
    pub inter_frame_delay_ms: u64,
    pub response_timeout_ms: u64,
    pub after_transmit_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub tcp_default_port: u16,
    pub tcp_unit_id: u8,
    /// 0 quiet, 1 mismatches, 2 frame dumps, 3 cursor tracing
    pub debug_level: u8,
    pub master_map: MasterMap,
    pub slave_map: SlaveMap,
    /// TCP port of the slave server; 0 disables it
    pub slave_port: u16,
    pub variables: VariableCounts,
    pub requests: Vec<crate::types::RequestSlot>,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            serial_port: String::new(),
            serial_speed: 9600,
            serial_data_bits: 8,
            serial_parity: SerialParity::None,
            serial_stop_bits: 1,
            serial_use_rts_to_send: false,
            element_offset: 0,
            inter_frame_delay_ms: 100,
            response_timeout_ms: 500,
            after_transmit_delay_ms: 0,
            connect_timeout_ms: 3000,
            tcp_default_port: MODBUS_TCP_PORT,
            tcp_unit_id: 1,
            debug_level: 0,
            master_map: MasterMap::default(),
            slave_map: SlaveMap::default(),
            slave_port: 9502,
            variables: VariableCounts::default(),
            requests: Vec::new(),
        }
    }
}

impl ModbusConfig {
    pub fn framing_mode(&self) -> FramingMode {
        if self.serial_port.trim().is_empty() {
            FramingMode::Tcp
        } else {
            FramingMode::Rtu
        }
    }

    pub fn inter_frame_delay(&self) -> Duration {
        Duration::from_millis(self.inter_frame_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn after_transmit_delay(&self) -> Duration {
        Duration::from_millis(self.after_transmit_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parse the target of a slot according to the configured transport
    pub fn target_of(&self, address: &str) -> ModbusResult<Target> {
        match self.framing_mode() {
            FramingMode::Rtu => Target::parse_rtu(address),
            FramingMode::Tcp => Target::parse_tcp(address, self.tcp_default_port),
        }
    }

    pub fn request_table(&self) -> ModbusResult<RequestTable> {
        RequestTable::from_slots(self.requests.clone())
    }

    /// Load-time validation of the whole configuration
    pub fn validate(&self) -> ModbusResult<()> {
        if self.element_offset > 1 {
            return Err(ModbusError::config(format!(
                "element_offset must be 0 or 1, got {}",
                self.element_offset
            )));
        }
        if self.response_timeout_ms == 0 {
            return Err(ModbusError::config("response_timeout_ms must be > 0"));
        }
        if self.requests.len() > MAX_REQUESTS {
            return Err(ModbusError::config(format!(
                "{} requests configured, table holds {}",
                self.requests.len(),
                MAX_REQUESTS
            )));
        }
        if self.framing_mode() == FramingMode::Rtu {
            if !(5..=8).contains(&self.serial_data_bits) {
                return Err(ModbusError::config("serial_data_bits must be 5..=8"));
            }
            if !(1..=2).contains(&self.serial_stop_bits) {
                return Err(ModbusError::config("serial_stop_bits must be 1 or 2"));
            }
            if self.serial_speed == 0 {
                return Err(ModbusError::config("serial_speed must be > 0"));
            }
        }

        for (index, slot) in self.requests.iter().enumerate() {
            if !slot.is_used() {
                continue;
            }
            self.target_of(&slot.target_address)
                .map_err(|e| ModbusError::config(format!("request #{}: {}", index, e)))?;
            if slot.function.uses_element_count() {
                let max = slot.function.max_quantity();
                if slot.element_count == 0 || slot.element_count > max {
                    return Err(ModbusError::config(format!(
                        "request #{}: {} element count {} outside 1..={}",
                        index, slot.function, slot.element_count, max
                    )));
                }
            }
            slot.check_bounds(self.element_offset)
                .map_err(|e| ModbusError::config(format!("request #{}: {}", index, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::RequestSlot;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
serial_port: ""
element_offset: 1
requests:
  - target_address: "192.168.1.20:1502"
    function: 3
    first_element: 1
    element_count: 4
"#;
        let config: ModbusConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.framing_mode(), FramingMode::Tcp);
        assert_eq!(config.response_timeout_ms, 500);
        assert_eq!(config.requests.len(), 1);
        assert_eq!(
            config.requests[0].function,
            RequestKind::ReadHoldingRegisters
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_function_code_rejected() {
        let yaml = "requests:\n  - target_address: '1'\n    function: 23\n";
        assert!(serde_yaml::from_str::<ModbusConfig>(yaml).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ModbusConfig {
            element_offset: 2,
            ..ModbusConfig::default()
        };
        assert!(config.validate().is_err());

        config.element_offset = 0;
        config.serial_port = "/dev/ttyS0".to_string();
        config.requests = vec![RequestSlot {
            target_address: "plc:502".to_string(),
            ..RequestSlot::default()
        }];
        assert!(matches!(config.validate(), Err(ModbusError::Config(_))));

        config.requests[0].target_address = "17".to_string();
        config.requests[0].element_count = 0;
        assert!(config.validate().is_err());

        config.requests[0].element_count = 2001;
        assert!(config.validate().is_err());

        config.requests[0].element_count = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_writes_ignore_element_count() {
        let config = ModbusConfig {
            requests: vec![RequestSlot {
                target_address: "plc".to_string(),
                function: RequestKind::WriteSingleRegister,
                element_count: 0,
                ..RequestSlot::default()
            }],
            ..ModbusConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_slot_outside_address_space_rejected() {
        let mut config = ModbusConfig {
            requests: vec![RequestSlot {
                target_address: "plc".to_string(),
                function: RequestKind::ReadHoldingRegisters,
                first_element: 65_530,
                element_count: 6,
                ..RequestSlot::default()
            }],
            ..ModbusConfig::default()
        };
        assert!(config.validate().is_ok());

        // 65530 + 7 runs past the last wire address
        config.requests[0].element_count = 7;
        assert!(matches!(config.validate(), Err(ModbusError::Config(_))));

        // Offset 1 shifts the window down by one
        config.element_offset = 1;
        assert!(config.validate().is_ok());

        config.element_offset = 0;
        config.requests[0].element_count = 1;
        config.requests[0].first_element = 70_000;
        assert!(matches!(config.validate(), Err(ModbusError::Config(_))));

        config.requests[0].first_element = 0;
        config.requests[0].variable_offset = usize::MAX;
        assert!(matches!(config.validate(), Err(ModbusError::Config(_))));
    }
}
