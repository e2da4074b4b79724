//! Polling cursor
//!
//! Which slot is in flight, the TCP transaction counter, and the
//! consecutive-error budget. One error counter is shared by the whole
//! table; it resets on any success.

use ladder_modbus::RequestTable;

/// Consecutive failures before the cursor is forced past a slot
pub const MAX_CONSECUTIVE_ERRORS: u8 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollingCursor {
    current: Option<usize>,
    transaction_id: u16,
    last_function_code: u8,
    consecutive_errors: u8,
}

impl PollingCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    pub fn last_function_code(&self) -> u8 {
        self.last_function_code
    }

    pub fn consecutive_errors(&self) -> u8 {
        self.consecutive_errors
    }

    /// Slot to poll this cycle
    ///
    /// Stays on the current slot while it is occupied, otherwise scans
    /// circularly from it. `None` when the table has no occupied slot.
    pub fn select(&mut self, table: &RequestTable) -> Option<usize> {
        let start = self.current.unwrap_or(0);
        self.current = table.occupied_from(start).next();
        self.current
    }

    /// Next MBAP transaction id (wrapping)
    pub fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    pub fn record_sent(&mut self, function_code: u8) {
        self.last_function_code = function_code;
    }

    pub fn record_success(&mut self, table: &RequestTable) {
        self.consecutive_errors = 0;
        self.advance(table);
    }

    /// Count a failed cycle; returns true when the cursor was forced forward
    pub fn record_failure(&mut self, table: &RequestTable) -> bool {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            self.consecutive_errors = 0;
            self.advance(table);
            return true;
        }
        false
    }

    fn advance(&mut self, table: &RequestTable) {
        self.current = match self.current {
            Some(index) => table.next_occupied_after(index),
            None => table.occupied_from(0).next(),
        };
    }

    /// Back to the initial state, keeping the transaction counter
    pub fn reset(&mut self) {
        *self = Self {
            transaction_id: self.transaction_id,
            ..Self::default()
        };
    }
}
