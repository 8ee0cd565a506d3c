//! Instrument transports
//!
//! A transport is a half-duplex line channel: one `write` of a command line,
//! then one `read` of the reply line. It carries no protocol knowledge; the
//! session decides what the lines mean and when the reply may be read.
//!
//! Back-ends:
//! - [`serial::SerialConnector`]: RS-232 via `serialport` (`instrument_serial`)
//! - [`visa::VisaConnector`]: GPIB/USB/LAN via `visa-rs` (`instrument_visa`)
//! - [`sim::SimulatedChamber`]: in-process instrument model

pub mod serial;
pub mod sim;
pub mod visa;

use crate::config::{InstrumentConfig, TransportKind};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use serial::SerialConnector;
pub use sim::{SimulatedChamber, WireEvent};
pub use visa::VisaConnector;

/// Errors raised by a transport back-end
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address could not be opened
    #[error("Failed to open '{address}': {reason}")]
    Open {
        /// Address as given
        address: String,
        /// Back-end message
        reason: String,
    },

    /// An open or read exceeded its bound
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The link is gone
    #[error("Transport closed")]
    Closed,

    /// A read was attempted with nothing written
    #[error("No reply pending")]
    NoResponse,

    /// Device I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Half-duplex line channel to the instrument
#[async_trait]
pub trait Transport: Send {
    /// Write one line; the back-end appends its own terminator
    async fn write(&mut self, line: &str) -> Result<(), TransportError>;

    /// Read one reply line, without its terminator
    async fn read(&mut self) -> Result<String, TransportError>;

    /// Human-readable description for logs
    fn describe(&self) -> &str;
}

/// Opens transports for an address
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open `address`; implementations may block up to their own limits,
    /// [`open_with_timeout`] bounds the whole attempt.
    async fn open(&self, address: &str) -> Result<Box<dyn Transport>, crate::error::ChamberError>;
}

/// Open `address` through `connector`, failing with
/// [`TransportError::Timeout`] when `timeout` elapses first.
pub async fn open_with_timeout(
    connector: &dyn Connector,
    address: &str,
    timeout: Duration,
) -> Result<Box<dyn Transport>, crate::error::ChamberError> {
    match tokio::time::timeout(timeout, connector.open(address)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout).into()),
    }
}

/// Build the connector selected by the configuration.
///
/// The simulated back-end gets a fresh [`SimulatedChamber`].
pub fn connector_for(config: &InstrumentConfig) -> Box<dyn Connector> {
    match config.transport {
        TransportKind::Serial => Box::new(SerialConnector::new(
            config.baud_rate,
            config.line_terminator.clone(),
            config.read_timeout(),
        )),
        TransportKind::Visa => Box::new(VisaConnector::new(
            config.line_terminator.clone(),
            config.read_timeout(),
        )),
        TransportKind::Simulated => Box::new(SimulatedChamber::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChamberError;

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_default_transport_names_missing_feature() {
        let config = InstrumentConfig::default();
        assert_eq!(config.transport, TransportKind::Visa);

        let connector = connector_for(&config);
        let result = open_with_timeout(connector.as_ref(), &config.address, config.connect_timeout()).await;
        match result {
            Err(ChamberError::FeatureNotEnabled(feature)) => assert_eq!(feature, "instrument_visa"),
            Err(other) => panic!("expected a missing feature, got {}", other),
            Ok(_) => panic!("visa transport opened without the feature"),
        }
    }

    #[tokio::test]
    async fn test_simulated_transport_answers() {
        let config = InstrumentConfig {
            transport: TransportKind::Simulated,
            ..InstrumentConfig::default()
        };
        let connector = connector_for(&config);
        let mut transport = open_with_timeout(connector.as_ref(), "SIM::1", Duration::from_secs(1))
            .await
            .unwrap();

        transport.write("TYPE?").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), "SU-241");
    }
}
