//! Master side: polling engine, cursor and published status

pub mod cursor;
pub mod engine;
pub mod status;

pub use cursor::{PollingCursor, MAX_CONSECUTIVE_ERRORS};
pub use engine::{CycleOutcome, MasterEngine};
pub use status::MasterStatus;
