//! VISA transport for GPIB/USB/LAN connected chambers
//!
//! Uses the `visa-rs` crate, which needs a VISA implementation (NI-VISA,
//! Keysight IO Libraries, ...) installed on the host. Supports resource
//! strings like:
//! - "GPIB0::10::INSTR" (GPIB interface)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! VISA calls block, so they run on Tokio's blocking thread pool.

use super::{Connector, Transport};
use crate::error::ChamberError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use super::TransportError;
#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Opens VISA resources
#[derive(Debug, Clone)]
pub struct VisaConnector {
    line_terminator: String,
    timeout: Duration,
}

impl VisaConnector {
    /// Create a connector; `timeout` bounds opening the resource
    pub fn new(line_terminator: String, timeout: Duration) -> Self {
        Self {
            line_terminator,
            timeout,
        }
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Connector for VisaConnector {
    async fn open(&self, address: &str) -> Result<Box<dyn Transport>, ChamberError> {
        let resource = address.to_string();
        let timeout = self.timeout;

        let instrument = tokio::task::spawn_blocking(move || {
            let open_error = |reason: String| TransportError::Open {
                address: resource.clone(),
                reason,
            };

            let rm = DefaultRM::new().map_err(|e| open_error(e.to_string()))?;
            let name = std::ffi::CString::new(resource.clone())
                .map_err(|e| open_error(e.to_string()))?;
            rm.open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| open_error(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;

        debug!(resource = address, "VISA resource opened");

        Ok(Box::new(VisaTransport {
            description: format!("visa {}", address),
            instrument: Arc::new(Mutex::new(instrument)),
            line_terminator: self.line_terminator.clone(),
        }))
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl Connector for VisaConnector {
    async fn open(&self, _address: &str) -> Result<Box<dyn Transport>, ChamberError> {
        Err(ChamberError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}

#[cfg(feature = "instrument_visa")]
struct VisaTransport {
    description: String,
    instrument: Arc<Mutex<Instrument>>,
    line_terminator: String,
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Transport for VisaTransport {
    async fn write(&mut self, line: &str) -> Result<(), TransportError> {
        let instrument = self.instrument.clone();
        let bytes = format!("{}{}", line, self.line_terminator).into_bytes();

        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let mut guard = instrument.lock().map_err(|_| TransportError::Closed)?;
            guard.write_all(&bytes)?;
            Ok(())
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        let instrument = self.instrument.clone();

        tokio::task::spawn_blocking(move || {
            use std::io::{BufRead, BufReader};

            let guard = instrument.lock().map_err(|_| TransportError::Closed)?;
            let mut response = String::new();
            let mut reader = BufReader::new(&*guard);
            if reader.read_line(&mut response)? == 0 {
                return Err(TransportError::Closed);
            }
            Ok(response.trim().to_string())
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
    }

    fn describe(&self) -> &str {
        &self.description
    }
}
