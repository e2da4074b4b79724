//! Variable Mapping Bridge
//!
//! The controller's variable store is an external collaborator shared with
//! the ladder evaluator. Everything the protocol engine reads or writes goes
//! through the [`VariableStore`] primitives; [`RequestBridge`] translates the
//! element numbers of one request slot into store indices.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{MasterMap, VariableCounts};
use crate::types::RequestSlot;

/// Internal variable areas of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    /// Memory bits (%B)
    #[serde(alias = "%B")]
    MemBit,
    /// Memory words (%W)
    #[serde(alias = "%W")]
    MemWord,
    /// Physical inputs (%I)
    #[serde(alias = "%I")]
    PhysInput,
    /// Physical outputs (%Q)
    #[serde(alias = "%Q")]
    PhysOutput,
    /// Physical word inputs (%IW)
    #[serde(alias = "%IW")]
    PhysWordInput,
    /// Physical word outputs (%QW)
    #[serde(alias = "%QW")]
    PhysWordOutput,
}

impl VarKind {
    pub const ALL: [VarKind; 6] = [
        VarKind::MemBit,
        VarKind::MemWord,
        VarKind::PhysInput,
        VarKind::PhysOutput,
        VarKind::PhysWordInput,
        VarKind::PhysWordOutput,
    ];

    /// Boolean areas hold 0/1 and honour inverted logic
    pub fn is_bit(self) -> bool {
        matches!(
            self,
            VarKind::MemBit | VarKind::PhysInput | VarKind::PhysOutput
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            VarKind::MemBit => "%B",
            VarKind::MemWord => "%W",
            VarKind::PhysInput => "%I",
            VarKind::PhysOutput => "%Q",
            VarKind::PhysWordInput => "%IW",
            VarKind::PhysWordOutput => "%QW",
        }
    }

    fn slot(self) -> usize {
        match self {
            VarKind::MemBit => 0,
            VarKind::MemWord => 1,
            VarKind::PhysInput => 2,
            VarKind::PhysOutput => 3,
            VarKind::PhysWordInput => 4,
            VarKind::PhysWordOutput => 5,
        }
    }
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Read/write primitives of the controller variable store
///
/// Calls are treated as atomic. Out-of-range reads return 0 and
/// out-of-range writes are ignored.
pub trait VariableStore: Send + Sync {
    fn read_variable(&self, kind: VarKind, index: usize) -> i32;

    fn write_variable(&self, kind: VarKind, index: usize, value: i32);

    /// Number of variables configured for `kind`
    fn capacity(&self, kind: VarKind) -> usize;
}

/// In-memory variable store sized from [`VariableCounts`]
#[derive(Debug)]
pub struct MemoryVariableStore {
    areas: [RwLock<Vec<i32>>; 6],
}

impl MemoryVariableStore {
    pub fn new(counts: &VariableCounts) -> Self {
        Self {
            areas: VarKind::ALL.map(|kind| RwLock::new(vec![0; counts.count(kind)])),
        }
    }

    /// Copy of a whole area (diagnostics and tests)
    pub fn snapshot(&self, kind: VarKind) -> Vec<i32> {
        self.areas[kind.slot()].read().clone()
    }
}

impl Default for MemoryVariableStore {
    fn default() -> Self {
        Self::new(&VariableCounts::default())
    }
}

impl VariableStore for MemoryVariableStore {
    fn read_variable(&self, kind: VarKind, index: usize) -> i32 {
        self.areas[kind.slot()]
            .read()
            .get(index)
            .copied()
            .unwrap_or(0)
    }

    fn write_variable(&self, kind: VarKind, index: usize, value: i32) {
        let value = if kind.is_bit() {
            i32::from(value != 0)
        } else {
            value
        };
        if let Some(cell) = self.areas[kind.slot()].write().get_mut(index) {
            *cell = value;
        }
    }

    fn capacity(&self, kind: VarKind) -> usize {
        self.areas[kind.slot()].read().len()
    }
}

/// Maps the Modbus elements of one request slot onto the variable store
///
/// Element `e` of the slot lands on variable `e - first_element + variable_offset`
/// of the area selected by the master map for the slot's function.
pub struct RequestBridge<'a> {
    slot: &'a RequestSlot,
    map: &'a MasterMap,
    store: &'a dyn VariableStore,
}

impl<'a> RequestBridge<'a> {
    pub fn new(slot: &'a RequestSlot, map: &'a MasterMap, store: &'a dyn VariableStore) -> Self {
        Self { slot, map, store }
    }

    pub fn kind(&self) -> VarKind {
        self.map.kind_for(self.slot.function)
    }

    /// `None` when the element is not part of the slot's variable window
    fn var_index(&self, element: u32) -> Option<usize> {
        let delta = element.checked_sub(self.slot.first_element)?;
        usize::try_from(delta)
            .ok()?
            .checked_add(self.slot.variable_offset)
    }

    fn apply_logic(&self, kind: VarKind, value: i32) -> i32 {
        if kind.is_bit() && self.slot.logic_inverted {
            i32::from(value == 0)
        } else {
            value
        }
    }

    /// Value to send for element `element`
    pub fn read_element(&self, element: u32) -> i32 {
        let kind = self.kind();
        let value = self
            .var_index(element)
            .map(|index| self.store.read_variable(kind, index))
            .unwrap_or(0);
        self.apply_logic(kind, value)
    }

    /// Store a value received for element `element`
    pub fn write_element(&self, element: u32, value: i32) {
        let kind = self.kind();
        if let Some(index) = self.var_index(element) {
            self.store
                .write_variable(kind, index, self.apply_logic(kind, value));
        }
    }

    /// Word sent in a diagnostics echo request
    pub fn diagnostic_echo_word(&self) -> u16 {
        self.store
            .read_variable(self.map.write_hold_regs, self.slot.variable_offset) as u16
    }

    /// Forward the word echoed back by the slave
    pub fn store_diagnostic_echo(&self, value: u16) {
        self.store.write_variable(
            self.map.read_hold_regs,
            self.slot.variable_offset,
            i32::from(value),
        );
    }
}
