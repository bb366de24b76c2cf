//! Scoped serial sessions.
//!
//! All bench instruments hang off USB-to-serial adapters and are driven the same way:
//! open the port, perform one exchange, close it. [`Transport::open`] hands back a boxed
//! [`SerialSession`] and the link is released when that box is dropped, so an early
//! return through `?` can never leave a port open.
//!
//! Reads block until their terminator arrives unless [`PortConfig::read_timeout`] is set.
//!
//! # Example
//! ```no_run
//! use spectral_bench::hardware::transport::{PortConfig, SerialTransport, Transport};
//!
//! # async fn demo() -> spectral_bench::error::AppResult<()> {
//! let transport = SerialTransport;
//! let config = PortConfig::mcpherson("/dev/ttyUSB0");
//! let mut session = transport.open(&config).await?;
//! session.write(b"X \r").await?;
//! let reply = session.read_until(b'\n').await?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parity setting for a serial port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    /// One stop bit
    One,
    /// Two stop bits
    Two,
}

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataBits {
    /// Seven data bits
    Seven,
    /// Eight data bits
    Eight,
}

/// Flow control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    None,
    /// XON/XOFF software flow control
    Software,
    /// RTS/CTS hardware flow control
    Hardware,
}

/// Everything needed to open one serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    /// OS device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
    /// Optional read timeout. `None` blocks until the terminator arrives.
    #[serde(default, with = "humantime_serde")]
    pub read_timeout: Option<Duration>,
}

impl PortConfig {
    /// 8N1 without flow control at the given baud rate.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            read_timeout: None,
        }
    }

    /// Settings shared by the McPherson scan controller, filter wheel and the
    /// VCM-D1 shutter driver: 9600 baud, 8N1, XON/XOFF.
    pub fn mcpherson(port: impl Into<String>) -> Self {
        Self::new(port, 9600).with_flow_control(FlowControl::Software)
    }

    /// Keithley 6482 RS-232 settings: 9600 baud, 8N1, no flow control.
    pub fn keithley(port: impl Into<String>) -> Self {
        Self::new(port, 9600)
    }

    /// Set flow control
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// One open serial link. Dropping the session closes the port.
#[async_trait]
pub trait SerialSession: Send {
    /// Device path this session is bound to
    fn port(&self) -> &str;

    /// Write all of `bytes`
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read up to and including `terminator`
    async fn read_until(&mut self, terminator: u8) -> AppResult<Vec<u8>>;

    /// Read exactly `len` bytes
    async fn read_exact(&mut self, len: usize) -> AppResult<Vec<u8>>;
}

/// Opens serial sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session with the given settings
    async fn open(&self, config: &PortConfig) -> AppResult<Box<dyn SerialSession>>;
}

/// Write `command` and read back one `terminator`-delimited line as text,
/// with surrounding whitespace removed.
pub async fn query_line(
    session: &mut dyn SerialSession,
    command: &[u8],
    terminator: u8,
) -> AppResult<String> {
    session.write(command).await?;
    let reply = session.read_until(terminator).await?;
    Ok(String::from_utf8_lossy(&reply).trim().to_string())
}

/// Transport backed by real serial ports through `tokio-serial`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialTransport;

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::*;
    use std::io;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio_serial::{SerialPortBuilderExt, SerialStream};

    pub(super) struct TokioSerialSession {
        port: String,
        stream: BufReader<SerialStream>,
        read_timeout: Option<Duration>,
    }

    impl TokioSerialSession {
        fn timed_out(&self) -> BenchError {
            BenchError::communication(
                self.port.clone(),
                io::Error::new(io::ErrorKind::TimedOut, "serial read timed out"),
            )
        }
    }

    #[async_trait]
    impl SerialSession for TokioSerialSession {
        fn port(&self) -> &str {
            &self.port
        }

        async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
            let stream = self.stream.get_mut();
            stream
                .write_all(bytes)
                .await
                .map_err(|e| BenchError::communication(self.port.clone(), e))?;
            stream
                .flush()
                .await
                .map_err(|e| BenchError::communication(self.port.clone(), e))
        }

        async fn read_until(&mut self, terminator: u8) -> AppResult<Vec<u8>> {
            let mut buf = Vec::new();
            let read = match self.read_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.stream.read_until(terminator, &mut buf))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => return Err(self.timed_out()),
                    }
                }
                None => self.stream.read_until(terminator, &mut buf).await,
            };
            let n = read.map_err(|e| BenchError::communication(self.port.clone(), e))?;
            if n == 0 {
                return Err(BenchError::communication(
                    self.port.clone(),
                    io::Error::new(io::ErrorKind::UnexpectedEof, "port closed"),
                ));
            }
            Ok(buf)
        }

        async fn read_exact(&mut self, len: usize) -> AppResult<Vec<u8>> {
            let mut buf = vec![0u8; len];
            let read = match self.read_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.stream.read_exact(&mut buf)).await {
                        Ok(result) => result,
                        Err(_) => return Err(self.timed_out()),
                    }
                }
                None => self.stream.read_exact(&mut buf).await,
            };
            read.map_err(|e| BenchError::communication(self.port.clone(), e))?;
            Ok(buf)
        }
    }

    pub(super) fn open(config: &PortConfig) -> AppResult<TokioSerialSession> {
        let data_bits = match config.data_bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        };
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        };
        let flow_control = match config.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| BenchError::communication(config.port.clone(), io::Error::from(e)))?;

        Ok(TokioSerialSession {
            port: config.port.clone(),
            stream: BufReader::new(stream),
            read_timeout: config.read_timeout,
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&self, config: &PortConfig) -> AppResult<Box<dyn SerialSession>> {
        #[cfg(feature = "instrument_serial")]
        {
            tracing::trace!(port = %config.port, baud = config.baud_rate, "opening serial port");
            let session = serial::open(config)?;
            Ok(Box::new(session))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = config;
            Err(BenchError::SerialFeatureDisabled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcpherson_ports_use_software_flow_control() {
        let config = PortConfig::mcpherson("/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.flow_control, FlowControl::Software);
        assert!(config.read_timeout.is_none());
    }

    #[test]
    fn keithley_port_has_no_flow_control() {
        let config = PortConfig::keithley("/dev/ttyUSB3")
            .with_read_timeout(Some(Duration::from_secs(2)));
        assert_eq!(config.flow_control, FlowControl::None);
        assert_eq!(config.read_timeout, Some(Duration::from_secs(2)));
    }
}
