//! Durable telemetry log
//!
//! CSV with a fixed header. Every appended row is flushed and synced to disk
//! before `append` returns, so a killed process loses at most the tick that
//! was being written.

use super::StatusSnapshot;
use crate::error::{AppResult, ChamberError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Column names, in order
pub const HEADER: [&str; 10] = [
    "Current",
    "Set",
    "High",
    "Low",
    "Mode",
    "Time",
    "Program number",
    "Program step number",
    "Step duration",
    "Program cycle count",
];

/// Program columns of a row logged while a program runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramColumns {
    /// Program number
    pub number: String,
    /// Program step number
    pub step: String,
    /// Time left in the step
    pub step_duration: String,
    /// Program cycle count
    pub cycles: String,
}

/// One retained tick
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Measured temperature
    pub current: f64,
    /// Reading set point, or the step target while a program runs
    pub set: String,
    /// High limit
    pub high: f64,
    /// Low limit
    pub low: f64,
    /// Mode as reported, e.g. `RUN 1`
    pub mode: String,
    /// Formatted local time
    pub time: String,
    /// Present only in RUN
    pub program: Option<ProgramColumns>,
}

impl LogRecord {
    /// Build the row for a snapshot.
    ///
    /// `None` when the snapshot has no reading or mode, or is in RUN without
    /// a program status.
    pub fn from_snapshot(snapshot: &StatusSnapshot, time_format: &str) -> Option<Self> {
        let reading = snapshot.reading?;
        let mode = snapshot.mode?;
        let time = snapshot.timestamp.format(time_format).to_string();

        let (set, program) = if mode.is_running() {
            let status = snapshot.program.as_ref()?;
            (
                status.target_temp.clone(),
                Some(ProgramColumns {
                    number: status.program_number.clone(),
                    step: status.current_step.clone(),
                    step_duration: status.step_time_remaining.clone(),
                    cycles: status.cycles_for_log(),
                }),
            )
        } else {
            (format!("{:.1}", reading.set), None)
        };

        Some(Self {
            current: reading.current,
            set,
            high: reading.high,
            low: reading.low,
            mode: mode.to_string(),
            time,
            program,
        })
    }

    fn fields(&self) -> Vec<String> {
        let mut fields = vec![
            format!("{:.1}", self.current),
            self.set.clone(),
            format!("{:.1}", self.high),
            format!("{:.1}", self.low),
            self.mode.clone(),
            self.time.clone(),
        ];
        if let Some(program) = &self.program {
            fields.extend([
                program.number.clone(),
                program.step.clone(),
                program.step_duration.clone(),
                program.cycles.clone(),
            ]);
        }
        fields
    }
}

/// Append-only CSV log of retained ticks
pub struct TelemetryLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

impl TelemetryLog {
    /// Open the log at `path`, creating it with the header if it is new.
    ///
    /// An existing log is continued; rows already on disk are never touched.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChamberError::persistence(&path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ChamberError::persistence(&path, e))?;
        let existing = file
            .metadata()
            .map_err(|e| ChamberError::persistence(&path, e))?
            .len();

        let mut log = Self::from_file(path, file);
        if existing == 0 {
            log.writer
                .write_record(HEADER)
                .map_err(|e| ChamberError::persistence(&log.path, e.into()))?;
            log.sync()?;
            info!(path = %log.path.display(), "Telemetry log created");
        } else {
            info!(path = %log.path.display(), bytes = existing, "Continuing telemetry log");
        }
        Ok(log)
    }

    /// Continue an existing log; no header is written.
    pub fn append_to(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| ChamberError::persistence(&path, e))?;

        info!(path = %path.display(), "Appending to telemetry log");
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: PathBuf, file: File) -> Self {
        let writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(file);
        Self {
            path,
            writer,
            rows: 0,
        }
    }

    /// Write one row and make it durable
    pub fn append(&mut self, record: &LogRecord) -> AppResult<()> {
        self.writer
            .write_record(record.fields())
            .map_err(|e| ChamberError::persistence(&self.path, e.into()))?;
        self.sync()?;
        self.rows += 1;
        debug!(rows = self.rows, "Telemetry row written");
        Ok(())
    }

    fn sync(&mut self) -> AppResult<()> {
        self.writer
            .flush()
            .map_err(|e| ChamberError::persistence(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| ChamberError::persistence(&self.path, e))
    }

    /// Log file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this handle
    pub fn rows_written(&self) -> u64 {
        self.rows
    }
}
