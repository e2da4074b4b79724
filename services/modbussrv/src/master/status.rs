//! Master status published after every cycle

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MasterStatus {
    /// Raised while the most recent cycle failed
    pub comm_error: bool,
    pub cycles: u64,
    pub successes: u64,
    /// Cycles that reached the wait state and failed
    pub failures: u64,
    /// Cycles aborted before the request went out
    pub aborted: u64,
    pub last_error: Option<String>,
    pub current_slot: Option<usize>,
}
