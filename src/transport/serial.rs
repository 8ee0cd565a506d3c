//! Serial transport for RS-232 connected chambers
//!
//! Wraps the `serialport` crate. The port is blocking, so every write and
//! read runs on Tokio's blocking thread pool.

use super::{Connector, Transport};
use crate::error::ChamberError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use super::TransportError;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Opens serial ports such as `/dev/ttyUSB0` or `COM3`
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud_rate: u32,
    line_terminator: String,
    read_timeout: Duration,
}

impl SerialConnector {
    /// Create a connector with the given line settings
    pub fn new(baud_rate: u32, line_terminator: String, read_timeout: Duration) -> Self {
        Self {
            baud_rate,
            line_terminator,
            read_timeout,
        }
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, address: &str) -> Result<Box<dyn Transport>, ChamberError> {
        let path = address.to_string();
        let baud_rate = self.baud_rate;

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud_rate)
                // Internal read timeout; the overall read limit is enforced per line
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| TransportError::Open {
                    address: path.clone(),
                    reason: e.to_string(),
                })
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;

        debug!(port = address, baud_rate, "Serial port opened");

        Ok(Box::new(SerialTransport {
            description: format!("serial {} @ {} baud", address, baud_rate),
            port: Arc::new(std::sync::Mutex::new(port)),
            line_terminator: self.line_terminator.clone(),
            read_timeout: self.read_timeout,
        }))
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, _address: &str) -> Result<Box<dyn Transport>, ChamberError> {
        Err(ChamberError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[cfg(feature = "instrument_serial")]
struct SerialTransport {
    description: String,
    port: Arc<std::sync::Mutex<Box<dyn serialport::SerialPort>>>,
    line_terminator: String,
    read_timeout: Duration,
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport {
    fn lock_port(
        port: &std::sync::Mutex<Box<dyn serialport::SerialPort>>,
    ) -> Result<std::sync::MutexGuard<'_, Box<dyn serialport::SerialPort>>, TransportError> {
        port.lock().map_err(|_| TransportError::Closed)
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, line: &str) -> Result<(), TransportError> {
        let port = self.port.clone();
        let bytes = format!("{}{}", line, self.line_terminator).into_bytes();

        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let mut guard = Self::lock_port(&port)?;
            guard.write_all(&bytes)?;
            guard.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        let port = self.port.clone();
        let timeout = self.read_timeout;

        tokio::task::spawn_blocking(move || {
            use std::io::Read;

            let mut guard = Self::lock_port(&port)?;
            let mut response = Vec::new();
            let mut byte = [0u8; 1];
            let start = std::time::Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(TransportError::Timeout(timeout));
                }

                match guard.read(&mut byte) {
                    Ok(1) => {
                        if byte[0] == b'\n' {
                            break;
                        }
                        response.push(byte[0]);
                    }
                    Ok(_) => return Err(TransportError::Closed),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(TransportError::Io(e)),
                }
            }

            Ok(String::from_utf8_lossy(&response).trim().to_string())
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
    }

    fn describe(&self) -> &str {
        &self.description
    }
}
