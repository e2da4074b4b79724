//! Modbus Service Library
//!
//! Runs the ladder controller's Modbus roles on top of `ladder-modbus`:
//!
//! - **Master**: polls the configured request table over a serial line
//!   (RTU) or pooled TCP connections (MBAP), one request in flight at a time.
//! - **Slave**: answers Modbus/TCP requests from the shared variable store.
//!
//! Both roles share the variable store and nothing else.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod master;
pub mod server;
pub mod transport;

pub use error::{Result, SrvError};
pub use master::{CycleOutcome, MasterEngine, MasterStatus};
pub use server::SlaveServer;
