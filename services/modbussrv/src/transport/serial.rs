//! Serial RTU Transport
//!
//! One shared RS-232/RS-485 line. The port is opened lazily so a missing
//! device only keeps the engine idle; any I/O error closes it again and
//! the next cycle reopens it.

use std::time::Duration;

use async_trait::async_trait;
use ladder_modbus::{FramingMode, ModbusConfig, RtuReplyAssembler, SerialParity, Target};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::traits::{Transport, TransportError};

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialTransportConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    pub parity: SerialParity,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Raise RTS for the duration of a transmit
    pub rts_to_send: bool,
}

impl SerialTransportConfig {
    pub fn from_modbus(config: &ModbusConfig) -> Self {
        Self {
            port: config.serial_port.trim().to_string(),
            baud_rate: config.serial_speed,
            data_bits: config.serial_data_bits,
            parity: config.serial_parity,
            stop_bits: config.serial_stop_bits,
            rts_to_send: config.serial_use_rts_to_send,
        }
    }

    fn parse_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            SerialParity::Even => tokio_serial::Parity::Even,
            SerialParity::Odd => tokio_serial::Parity::Odd,
            SerialParity::None => tokio_serial::Parity::None,
        }
    }

    fn parse_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn parse_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Serial transport implementation
#[derive(Debug)]
pub struct SerialTransport {
    config: SerialTransportConfig,
    port: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(config: SerialTransportConfig) -> Self {
        Self { config, port: None }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn slave_of(target: &Target) -> Result<u8, TransportError> {
        match target {
            Target::Rtu { slave } => Ok(*slave),
            Target::Tcp { .. } => Err(TransportError::InvalidTarget(format!(
                "{} is not a serial slave",
                target.endpoint()
            ))),
        }
    }

    fn port_mut(&mut self) -> Result<&mut SerialStream, TransportError> {
        self.port
            .as_mut()
            .ok_or_else(|| TransportError::NotReady(format!("{} not open", self.config.port)))
    }

    fn drop_port(&mut self, reason: &str) {
        if self.port.take().is_some() {
            warn!("Closed serial port {}: {}", self.config.port, reason);
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let rts = self.config.rts_to_send;
        let Some(port) = self.port.as_mut() else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        // Stale bytes (late replies to abandoned requests) must not
        // prefix the next reply
        if let Err(e) = port.clear(ClearBuffer::Input) {
            debug!("Serial input flush failed: {e}");
        }
        if rts {
            port.write_request_to_send(true)?;
        }
        let result = async {
            port.write_all(frame).await?;
            port.flush().await
        }
        .await;
        if rts {
            port.write_request_to_send(false)?;
        }
        result
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn framing(&self) -> FramingMode {
        FramingMode::Rtu
    }

    fn name(&self) -> &str {
        &self.config.port
    }

    async fn ensure_ready(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }

        debug!("Opening serial port: {}", self.config.port);
        let port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(self.config.parse_data_bits())
            .parity(self.config.parse_parity())
            .stop_bits(self.config.parse_stop_bits())
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                TransportError::NotReady(format!(
                    "failed to open serial port {}: {e}",
                    self.config.port
                ))
            })?;

        info!(
            "Opened serial port {} ({} baud, {}{:?}{})",
            self.config.port,
            self.config.baud_rate,
            self.config.data_bits,
            self.config.parity,
            self.config.stop_bits
        );
        self.port = Some(port);
        Ok(())
    }

    async fn send(&mut self, target: &Target, frame: &[u8]) -> Result<(), TransportError> {
        Self::slave_of(target)?;
        self.port_mut()?;
        if let Err(e) = self.write_frame(frame).await {
            self.drop_port(&e.to_string());
            return Err(TransportError::SendFailed(format!(
                "write to {} failed: {e}",
                self.config.port
            )));
        }
        Ok(())
    }

    async fn receive(
        &mut self,
        target: &Target,
        expected_pdu_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let slave = Self::slave_of(target)?;
        let name = self.config.port.clone();
        let port = self.port_mut()?;
        let result = read_rtu_reply(port, &name, slave, expected_pdu_len, timeout).await;
        if let Err(TransportError::ReceiveFailed(reason)) = &result {
            self.drop_port(reason);
        }
        result
    }

    async fn close(&mut self) {
        self.drop_port("closing");
    }
}

/// Read one RTU reply from `reader` until the frame is complete
///
/// End of stream counts as a failed read rather than an empty poll, so a
/// vanished device is reported at once instead of spinning until the
/// deadline.
async fn read_rtu_reply<R>(
    reader: &mut R,
    name: &str,
    slave: u8,
    expected_pdu_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut assembler = RtuReplyAssembler::new(slave, expected_pdu_len);
    let mut chunk = [0u8; 256];

    while !assembler.is_complete() {
        match timeout_at(deadline, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                return Err(TransportError::ReceiveFailed(format!(
                    "{} closed after {} byte(s) from slave {}",
                    name,
                    assembler.as_bytes().len(),
                    slave
                )));
            },
            Ok(Ok(n)) => {
                assembler.push(&chunk[..n]);
            },
            Ok(Err(e)) => {
                return Err(TransportError::ReceiveFailed(format!(
                    "read from {name} failed: {e}"
                )));
            },
            Err(_) => {
                return Err(TransportError::Timeout(format!(
                    "slave {} answered {} of {} bytes within {:?}",
                    slave,
                    assembler.as_bytes().len(),
                    assembler.as_bytes().len() + assembler.remaining(),
                    timeout
                )));
            },
        }
    }

    if assembler.noise() > 0 {
        debug!(
            "Discarded {} noise byte(s) before slave {} reply",
            assembler.noise(),
            slave
        );
    }
    Ok(assembler.as_bytes().to_vec())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use ladder_modbus::crc;

    #[test]
    fn test_config_from_modbus() {
        let modbus = ModbusConfig {
            serial_port: " /dev/ttyS1 ".to_string(),
            serial_speed: 19200,
            serial_parity: SerialParity::Even,
            serial_stop_bits: 2,
            serial_use_rts_to_send: true,
            ..ModbusConfig::default()
        };
        let config = SerialTransportConfig::from_modbus(&modbus);
        assert_eq!(config.port, "/dev/ttyS1");
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.parse_parity(), tokio_serial::Parity::Even);
        assert_eq!(config.parse_stop_bits(), tokio_serial::StopBits::Two);
        assert_eq!(config.parse_data_bits(), tokio_serial::DataBits::Eight);
        assert!(config.rts_to_send);
    }

    #[tokio::test]
    async fn test_missing_device_is_not_ready() {
        let mut transport = SerialTransport::new(SerialTransportConfig {
            port: "/dev/modbussrv-no-such-port".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            rts_to_send: false,
        });
        assert!(matches!(
            transport.ensure_ready().await,
            Err(TransportError::NotReady(_))
        ));
        assert!(!transport.is_open());

        let target = Target::Rtu { slave: 1 };
        assert!(matches!(
            transport.send(&target, &[0x01]).await,
            Err(TransportError::NotReady(_))
        ));

        let tcp = Target::Tcp {
            host: "plc".to_string(),
            port: 502,
        };
        assert!(matches!(
            transport.send(&tcp, &[0x01]).await,
            Err(TransportError::InvalidTarget(_))
        ));
    }

    fn reply(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        crc::append(&mut frame);
        frame
    }

    #[tokio::test]
    async fn test_reply_assembled_across_reads() {
        let (mut device, mut port) = tokio::io::duplex(64);
        let frame = reply(&[0x05, 0x03, 0x02, 0x00, 0x2A]);
        let writer = {
            let frame = frame.clone();
            tokio::spawn(async move {
                device.write_all(&[0xFF]).await.unwrap();
                device.write_all(&frame[..3]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                device.write_all(&frame[3..]).await.unwrap();
                device
            })
        };

        let received = read_rtu_reply(&mut port, "test", 5, 4, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received, frame);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_fails_before_deadline() {
        let (mut device, mut port) = tokio::io::duplex(64);
        device.write_all(&[0x05, 0x03]).await.unwrap();
        drop(device);

        let started = std::time::Instant::now();
        let result = read_rtu_reply(&mut port, "test", 5, 4, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_silent_stream_times_out() {
        let (_device, mut port) = tokio::io::duplex(64);
        let result = read_rtu_reply(&mut port, "test", 5, 4, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }
}
