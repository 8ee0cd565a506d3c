//! Telemetry poller
//!
//! A background task that, every tick:
//! 1. sleeps the tick interval,
//! 2. takes the session once and reads temperature, mode (always freshly
//!    queried) and, in RUN, the program monitor,
//! 3. publishes a [`StatusSnapshot`] on a `watch` channel,
//! 4. appends a row to the [`TelemetryLog`] when the [`RetentionPolicy`]
//!    retains the tick.
//!
//! A persistence or transport fault halts the poller: it publishes
//! [`LiveStatus::Halted`], disconnects the session and returns the error.
//! Logging is never silently dropped.
//!
//! Stopping is cooperative and only observed between ticks, never in the
//! middle of an exchange.

pub mod log;

pub use self::log::{LogRecord, TelemetryLog};

use crate::config::{PollerConfig, StorageConfig};
use crate::error::{AppResult, ChamberError};
use crate::protocol::{Mode, ModeReport, ProgramStatus, Reading};
use crate::session::ChamberSession;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Which ticks are written to the durable log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Retain every Nth tick while a program runs
    pub run_every: u64,
    /// Retain every Nth tick in any other mode
    pub idle_every: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            run_every: 3,
            idle_every: 5,
        }
    }
}

impl RetentionPolicy {
    /// Whether the 0-based `tick` is retained in `mode`
    pub fn retains(&self, tick: u64, mode: &ModeReport) -> bool {
        let every = if mode.is_running() {
            self.run_every
        } else {
            self.idle_every
        };
        tick % every.max(1) == 0
    }
}

/// State observed on one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Local time the tick started
    pub timestamp: DateTime<Local>,
    /// `None` when `TEMP?` failed
    pub reading: Option<Reading>,
    /// Fresh mode, or the session's last known mode when `MODE?` failed
    pub mode: Option<ModeReport>,
    /// Whether `mode` came from this tick's query
    pub mode_fresh: bool,
    /// Program monitor, only queried in RUN
    pub program: Option<ProgramStatus>,
    /// Tick counter, from 0
    pub tick: u64,
    /// Whether this tick was written to the log
    pub retained: bool,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reading {
            Some(reading) => writeln!(f, "Current temperature: {:.1}", reading.current)?,
            None => writeln!(f, "Current temperature: unavailable")?,
        }
        writeln!(f, "Time: {}", self.timestamp.format("%H:%M:%S"))?;
        match &self.mode {
            Some(mode) if self.mode_fresh => writeln!(f, "Mode: {}", mode)?,
            Some(mode) => writeln!(f, "Mode: {} (last known)", mode)?,
            None => writeln!(f, "Mode: unknown")?,
        }

        match (&self.mode, &self.program, &self.reading) {
            (Some(mode), Some(program), _) if mode.is_running() => {
                writeln!(f, "Current program: {}", program.program_number)?;
                writeln!(f, "Step target temperature: {}", program.target_temp)?;
                writeln!(f, "Current step: {}", program.current_step)?;
                writeln!(f, "Current step time left: {}", program.step_time_remaining)?;
                write!(f, "Program cycles remaining: {}", program.repeat_cycles_remaining)
            }
            (Some(mode), _, Some(reading)) if mode.mode == Mode::Constant => {
                writeln!(f, "Set temperature: {:.1}", reading.set)?;
                writeln!(f, "High: {:.1}", reading.high)?;
                write!(f, "Low: {:.1}", reading.low)
            }
            _ => Ok(()),
        }
    }
}

/// Value of the live status channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LiveStatus {
    /// No tick completed yet
    Starting,
    /// Latest completed tick
    Snapshot(StatusSnapshot),
    /// The poller stopped on a fault
    Halted(String),
}

/// How the poller ended without a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// Stop was requested
    Stopped,
    /// The configured number of ticks ran
    Completed {
        /// Ticks run
        ticks: u64,
    },
}

/// Background telemetry poller
pub struct TelemetryPoller {
    session: ChamberSession,
    log: TelemetryLog,
    tick_interval: Duration,
    retention: RetentionPolicy,
    time_format: String,
    tick_limit: Option<u64>,
}

impl TelemetryPoller {
    /// Poller over `session` writing retained ticks to `log`
    pub fn new(
        session: ChamberSession,
        log: TelemetryLog,
        poller: &PollerConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            session,
            log,
            tick_interval: poller.tick_interval(),
            retention: poller.retention(),
            time_format: storage.time_format.clone(),
            tick_limit: None,
        }
    }

    /// Stop by itself after `ticks` ticks
    pub fn with_tick_limit(mut self, ticks: u64) -> Self {
        self.tick_limit = Some(ticks);
        self
    }

    /// Start polling on the Tokio runtime
    pub fn spawn(self) -> PollerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(LiveStatus::Starting);

        let task = tokio::spawn(self.run(stop_rx, status_tx));

        PollerHandle {
            stop: stop_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        status: watch::Sender<LiveStatus>,
    ) -> AppResult<PollerExit> {
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            log = %self.log.path().display(),
            "Telemetry poller started"
        );
        let mut tick: u64 = 0;

        loop {
            if *stop.borrow() {
                info!(ticks = tick, "Telemetry poller stopped");
                return Ok(PollerExit::Stopped);
            }
            if self.tick_limit.is_some_and(|limit| tick >= limit) {
                info!(ticks = tick, "Telemetry poller completed");
                return Ok(PollerExit::Completed { ticks: tick });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        // Handle dropped without an explicit stop
                        return Ok(PollerExit::Stopped);
                    }
                    continue;
                }
            }

            if let Err(e) = self.tick(tick, &status).await {
                error!(error = %e, "Telemetry poller halted");
                status.send_replace(LiveStatus::Halted(e.to_string()));
                self.session.disconnect().await;
                return Err(e);
            }
            tick += 1;
        }
    }

    async fn tick(&mut self, tick: u64, status: &watch::Sender<LiveStatus>) -> AppResult<()> {
        let (reading, fresh_mode, program) = {
            let mut exchange = self.session.exclusive().await;
            let reading = exchange.read_temperature().await?;
            let mode = exchange.mode().await?;
            let program = match mode {
                Some(mode) if mode.is_running() => exchange.program_status().await?,
                _ => None,
            };
            (reading, mode, program)
        };

        let mode = fresh_mode.or_else(|| self.session.last_known_mode());
        let mut snapshot = StatusSnapshot {
            timestamp: Local::now(),
            reading,
            mode,
            mode_fresh: fresh_mode.is_some(),
            program,
            tick,
            retained: false,
        };

        let record = match fresh_mode {
            Some(mode) if self.retention.retains(tick, &mode) => {
                LogRecord::from_snapshot(&snapshot, &self.time_format)
            }
            _ => None,
        };
        snapshot.retained = record.is_some();
        debug!(tick, retained = snapshot.retained, "Telemetry tick");
        status.send_replace(LiveStatus::Snapshot(snapshot));

        if let Some(record) = record {
            self.log.append(&record)?;
        }
        Ok(())
    }
}

/// Control handle for a spawned poller
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    status: watch::Receiver<LiveStatus>,
    task: JoinHandle<AppResult<PollerExit>>,
}

impl PollerHandle {
    /// Receiver of the live status
    pub fn subscribe(&self) -> watch::Receiver<LiveStatus> {
        self.status.clone()
    }

    /// Request a stop; observed before the next tick
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Whether the task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the poller to end
    pub async fn join(self) -> AppResult<PollerExit> {
        self.task
            .await
            .map_err(|e| ChamberError::Io(std::io::Error::other(e)))?
    }

    /// Stop and wait
    pub async fn shutdown(self) -> AppResult<PollerExit> {
        self.stop();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_retains_every_third_tick() {
        let policy = RetentionPolicy::default();
        let run = ModeReport {
            mode: Mode::Run,
            program: Some(1),
        };
        let retained: Vec<u64> = (0..10).filter(|t| policy.retains(*t, &run)).collect();
        assert_eq!(retained, vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_other_modes_retain_every_fifth_tick() {
        let policy = RetentionPolicy::default();
        for mode in [Mode::Off, Mode::Standby, Mode::Constant] {
            let report = ModeReport::plain(mode);
            let retained: Vec<u64> = (0..11).filter(|t| policy.retains(*t, &report)).collect();
            assert_eq!(retained, vec![0, 5, 10]);
        }
    }

    #[test]
    fn test_snapshot_display_constant() {
        let snapshot = StatusSnapshot {
            timestamp: Local::now(),
            reading: Some(Reading {
                current: 22.5,
                set: 23.0,
                high: 85.0,
                low: -45.0,
            }),
            mode: Some(ModeReport::plain(Mode::Constant)),
            mode_fresh: true,
            program: None,
            tick: 0,
            retained: true,
        };
        let text = snapshot.to_string();
        assert!(text.contains("Current temperature: 22.5"));
        assert!(text.contains("Mode: CONSTANT"));
        assert!(text.contains("Set temperature: 23.0"));
    }
}
