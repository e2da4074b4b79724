//! Transport layer: serial RTU line or pooled Modbus/TCP connections

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use mock::MockTransport;
pub use serial::{SerialTransport, SerialTransportConfig};
pub use tcp::{ConnectionPool, TcpTransport};
pub use traits::{Transport, TransportError};

use ladder_modbus::constants::MAX_REQUESTS;
use ladder_modbus::{FramingMode, ModbusConfig};

/// Build the transport selected by the configuration
///
/// An empty serial port selects Modbus/TCP. The TCP pool holds one entry
/// per table slot.
pub fn from_config(config: &ModbusConfig) -> Box<dyn Transport> {
    match config.framing_mode() {
        FramingMode::Rtu => Box::new(SerialTransport::new(SerialTransportConfig::from_modbus(
            config,
        ))),
        FramingMode::Tcp => Box::new(TcpTransport::new(
            MAX_REQUESTS,
            config.connect_timeout(),
        )),
    }
}
