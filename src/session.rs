//! Instrument session
//!
//! The session is the single owner of the transport. Every exchange (write a
//! line, wait the settle delay, read the reply) runs while holding one async
//! mutex, so two exchanges can never interleave on the half-duplex wire.
//!
//! Callers that need several exchanges as one unit (the telemetry poller's
//! snapshot, the program author's edit envelope) take an [`Exchange`] guard
//! with [`ChamberSession::exclusive`] and issue their exchanges through it.
//! Single typed operations on [`ChamberSession`] take the guard for exactly
//! one exchange.
//!
//! ## Failure semantics
//!
//! - A negative acknowledgement is a value (`Ack::Nok`, `None`), never an error.
//! - A transport error drops the transport and marks the session disconnected.
//!   It is returned as `ChamberError::Transport`; every later exchange fails
//!   fast with `ChamberError::NotConnected`.
//!
//! ## Cached hints
//!
//! `last_known_mode` and `is_program_running` are refreshed from replies but
//! are advisory only. The instrument is the authority; the poller re-queries
//! the mode on every tick.

use crate::config::InstrumentConfig;
use crate::error::{AppResult, ChamberError};
use crate::program::ProgramSlot;
use crate::protocol::{
    classify_query, Ack, Command, Mode, ModeReport, ProgramStatus, Reading, TemperatureLimits,
};
use crate::transport::{open_with_timeout, Connector, Transport, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Timing options for a session
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Bound on opening the transport
    pub connect_timeout: Duration,
    /// Delay between a write and the read of its reply
    pub settle_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&InstrumentConfig::default())
    }
}

impl From<&InstrumentConfig> for SessionOptions {
    fn from(config: &InstrumentConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            settle_delay: config.settle_delay(),
        }
    }
}

/// Result of asking the chamber to run a program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Command acknowledged and `MODE?` confirms RUN
    Started(ModeReport),
    /// Command acknowledged but the chamber did not report RUN
    NotConfirmed(Option<ModeReport>),
    /// Command rejected
    Rejected,
}

impl RunOutcome {
    /// Whether the program is confirmed running
    pub fn is_started(&self) -> bool {
        matches!(self, RunOutcome::Started(_))
    }
}

struct SessionInner {
    address: String,
    transport: Mutex<Option<Box<dyn Transport>>>,
    settle_delay: Duration,
    connected: AtomicBool,
    running: AtomicBool,
    last_mode: std::sync::Mutex<Option<ModeReport>>,
}

impl SessionInner {
    fn remember_mode(&self, report: Option<ModeReport>) {
        if let Some(report) = report {
            self.running.store(report.is_running(), Ordering::SeqCst);
        }
        *self
            .last_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = report;
    }
}

/// Connected session with the chamber
///
/// Cheap to clone; clones share the transport and its lock.
#[derive(Clone)]
pub struct ChamberSession {
    inner: Arc<SessionInner>,
}

impl ChamberSession {
    /// Open the transport at `address` and read the current mode.
    ///
    /// On any transport fault no session is returned.
    pub async fn connect(
        connector: &dyn Connector,
        address: &str,
        options: SessionOptions,
    ) -> AppResult<Self> {
        info!(address, "Connecting to chamber");
        let transport = open_with_timeout(connector, address, options.connect_timeout)
            .await
            .inspect_err(|e| warn!(address, error = %e, "Connection failed"))?;
        debug!(transport = transport.describe(), "Transport open");

        let session = Self {
            inner: Arc::new(SessionInner {
                address: address.to_string(),
                transport: Mutex::new(Some(transport)),
                settle_delay: options.settle_delay,
                connected: AtomicBool::new(true),
                running: AtomicBool::new(false),
                last_mode: std::sync::Mutex::new(None),
            }),
        };

        match session.exclusive().await.mode().await? {
            Some(mode) => info!(address, %mode, "Connected to chamber"),
            None => warn!(address, "Connected, but the chamber did not report its mode"),
        }
        Ok(session)
    }

    /// Take exclusive use of the transport for one or more exchanges.
    ///
    /// Waits for any exchange in flight to complete.
    pub async fn exclusive(&self) -> Exchange<'_> {
        Exchange {
            session: &self.inner,
            transport: self.inner.transport.lock().await,
        }
    }

    /// Address the session was opened with
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Whether the transport is still usable
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Last mode observed in a reply (advisory)
    pub fn last_known_mode(&self) -> Option<ModeReport> {
        *self
            .inner
            .last_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the last observation showed a running program (advisory)
    pub fn is_program_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Drop the transport after any in-flight exchange.
    ///
    /// The chamber keeps its current mode; a running program stays running.
    pub async fn disconnect(&self) {
        let mut transport = self.inner.transport.lock().await;
        if transport.take().is_some() {
            info!(address = %self.inner.address, "Disconnected from chamber");
        }
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    /// Send a raw command line and classify the acknowledgement
    pub async fn send(&self, line: &str) -> AppResult<Ack> {
        self.exclusive().await.send_line(line).await
    }

    /// Send a raw query line; `None` when the chamber answers `NOK`
    pub async fn query(&self, line: &str) -> AppResult<Option<String>> {
        self.exclusive().await.query_line(line).await
    }

    /// Instrument type string
    pub async fn identify(&self) -> AppResult<Option<String>> {
        self.exclusive().await.identify().await
    }

    /// Freshly queried mode
    pub async fn mode(&self) -> AppResult<Option<ModeReport>> {
        self.exclusive().await.mode().await
    }

    /// Switch mode
    pub async fn set_mode(&self, mode: Mode) -> AppResult<Ack> {
        self.exclusive().await.set_mode(mode).await
    }

    /// Power on (the chamber enters STANDBY)
    pub async fn power_on(&self) -> AppResult<Ack> {
        self.exclusive().await.power_on().await
    }

    /// Power off
    pub async fn power_off(&self) -> AppResult<Ack> {
        self.exclusive().await.power_off().await
    }

    /// Set the constant-mode set point and limits
    pub async fn set_temperature(&self, set: f64, limits: TemperatureLimits) -> AppResult<Ack> {
        self.exclusive().await.set_temperature(set, limits).await
    }

    /// Current temperature reading; `None` when unavailable
    pub async fn read_temperature(&self) -> AppResult<Option<Reading>> {
        self.exclusive().await.read_temperature().await
    }

    /// Program monitor; the idle sentinel when no program runs
    pub async fn program_status(&self) -> AppResult<Option<ProgramStatus>> {
        self.exclusive().await.program_status().await
    }

    /// Start a stored program and confirm the chamber entered RUN
    pub async fn run_program(&self, slot: ProgramSlot) -> AppResult<RunOutcome> {
        self.exclusive().await.run_program(slot).await
    }
}

/// Exclusive use of the transport
///
/// Holding an `Exchange` blocks every other caller of the session. Dropping it
/// releases the transport.
pub struct Exchange<'a> {
    session: &'a SessionInner,
    transport: MutexGuard<'a, Option<Box<dyn Transport>>>,
}

impl Exchange<'_> {
    async fn round_trip(
        transport: &mut dyn Transport,
        line: &str,
        settle_delay: Duration,
    ) -> Result<String, TransportError> {
        transport.write(line).await?;
        tokio::time::sleep(settle_delay).await;
        transport.read().await
    }

    /// One write/settle/read cycle
    async fn exchange(&mut self, line: &str) -> AppResult<String> {
        let transport = self.transport.as_mut().ok_or(ChamberError::NotConnected)?;

        match Self::round_trip(&mut **transport, line, self.session.settle_delay).await {
            Ok(reply) => {
                debug!(command = line, reply = %reply, "Exchange");
                Ok(reply)
            }
            Err(e) => {
                warn!(command = line, error = %e, "Transport fault, closing session");
                *self.transport = None;
                self.session.connected.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Send a command line and classify the acknowledgement
    pub async fn send_line(&mut self, line: &str) -> AppResult<Ack> {
        let reply = self.exchange(line).await?;
        let ack = Ack::classify(&reply);
        if ack == Ack::Nok {
            warn!(command = line, reply = %reply, "Command rejected");
        }
        Ok(ack)
    }

    /// Send a query line; `None` on a `NOK` reply
    pub async fn query_line(&mut self, line: &str) -> AppResult<Option<String>> {
        let reply = self.exchange(line).await?;
        let result = classify_query(&reply);
        if result.is_none() {
            warn!(query = line, "Query rejected");
        }
        Ok(result)
    }

    /// Send a typed command
    pub async fn send(&mut self, command: &Command) -> AppResult<Ack> {
        self.send_line(&command.to_string()).await
    }

    /// Send a typed query
    pub async fn query(&mut self, command: &Command) -> AppResult<Option<String>> {
        self.query_line(&command.to_string()).await
    }

    /// Instrument type string
    pub async fn identify(&mut self) -> AppResult<Option<String>> {
        self.query(&Command::Identify).await
    }

    /// Query the mode and refresh the cached hints
    pub async fn mode(&mut self) -> AppResult<Option<ModeReport>> {
        let report = self
            .query(&Command::QueryMode)
            .await?
            .and_then(|reply| match reply.parse::<ModeReport>() {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "Unreadable mode reply");
                    None
                }
            });
        if report.is_some() {
            self.session.remember_mode(report);
        }
        Ok(report)
    }

    /// Switch mode
    pub async fn set_mode(&mut self, mode: Mode) -> AppResult<Ack> {
        let ack = self.send(&Command::SetMode(mode)).await?;
        if ack.is_ok() {
            self.session.remember_mode(Some(ModeReport::plain(mode)));
        }
        Ok(ack)
    }

    /// Power on
    pub async fn power_on(&mut self) -> AppResult<Ack> {
        self.send(&Command::PowerOn).await
    }

    /// Power off
    pub async fn power_off(&mut self) -> AppResult<Ack> {
        let ack = self.send(&Command::PowerOff).await?;
        if ack.is_ok() {
            self.session.remember_mode(Some(ModeReport::plain(Mode::Off)));
        }
        Ok(ack)
    }

    /// Set the constant-mode set point and limits (one decimal on the wire)
    pub async fn set_temperature(&mut self, set: f64, limits: TemperatureLimits) -> AppResult<Ack> {
        self.send(&Command::SetTemperature {
            set,
            high: limits.high,
            low: limits.low,
        })
        .await
    }

    /// Current temperature reading; `None` when the query fails or is garbled
    pub async fn read_temperature(&mut self) -> AppResult<Option<Reading>> {
        let reading = self
            .query(&Command::QueryTemperature)
            .await?
            .and_then(|reply| match reply.parse::<Reading>() {
                Ok(reading) => Some(reading),
                Err(e) => {
                    warn!(error = %e, "Unreadable temperature reply");
                    None
                }
            });
        Ok(reading)
    }

    /// Program monitor
    ///
    /// "Controller not ready" is the normal idle answer and yields
    /// [`ProgramStatus::idle`]. `None` only for a rejected or garbled reply.
    pub async fn program_status(&mut self) -> AppResult<Option<ProgramStatus>> {
        let status = self
            .query(&Command::ProgramMonitor)
            .await?
            .and_then(|reply| match reply.parse::<ProgramStatus>() {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(error = %e, "Unreadable program monitor reply");
                    None
                }
            });
        Ok(status)
    }

    /// Start a stored program, then confirm with `MODE?` in the same unit
    pub async fn run_program(&mut self, slot: ProgramSlot) -> AppResult<RunOutcome> {
        if self.send(&Command::RunProgram(slot)).await? == Ack::Nok {
            return Ok(RunOutcome::Rejected);
        }

        let outcome = match self.mode().await? {
            Some(report) if report.is_running() => {
                info!(program = %slot, "Program started");
                RunOutcome::Started(report)
            }
            other => {
                warn!(program = %slot, mode = ?other, "Run acknowledged but chamber is not in RUN");
                RunOutcome::NotConfirmed(other)
            }
        };
        Ok(outcome)
    }
}
