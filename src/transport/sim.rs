//! Simulated SU-241 chamber
//!
//! An in-process model of the instrument that speaks the same line protocol
//! as the hardware. It backs the test suite and `chamberctl --simulate`.
//!
//! It provides:
//! - Mode, power, set point and limit handling
//! - Temperature drift towards the set point on every `TEMP?`
//! - Program memory guarded by the `EDIT START` / `EDIT END` envelope
//! - Scripted replies and transport faults for failure injection
//! - An ordered wire log of every write and read
//!
//! # Example
//!
//! ```
//! use chamber_daq::transport::SimulatedChamber;
//!
//! let chamber = SimulatedChamber::new();
//! chamber.reject("EDIT END");
//! assert!(chamber.wire_log().is_empty());
//! ```

use super::{Connector, Transport, TransportError};
use crate::error::ChamberError;
use crate::protocol::{Mode, ModeReport, CONTROLLER_NOT_READY};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const MODEL_NAME: &str = "SU-241";
/// Degrees the simulated air temperature moves towards the target per `TEMP?`
const DRIFT_PER_READ: f64 = 0.5;

/// One line crossing the simulated wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Line sent by the driver
    Write(String),
    /// Reply returned to the driver
    Read(String),
}

/// Program held in simulated program memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredProgram {
    /// Directive bodies in the order they were written, e.g. `STEP1, TIME00:30`
    pub directives: Vec<String>,
}

impl StoredProgram {
    fn first_target(&self) -> Option<f64> {
        self.directives.iter().find_map(|d| {
            d.split(',')
                .map(str::trim)
                .find_map(|field| field.strip_prefix("TEMP"))
                .and_then(|t| t.parse().ok())
        })
    }

    fn first_duration(&self) -> Option<String> {
        self.directives.iter().find_map(|d| {
            d.split(',')
                .map(str::trim)
                .find_map(|field| field.strip_prefix("TIME"))
                .map(str::to_string)
        })
    }

    fn cycles(&self) -> u32 {
        self.directives
            .iter()
            .find_map(|d| d.strip_prefix("COUNT, "))
            .and_then(|spec| {
                spec.trim_matches(|c| c == '(' || c == ')')
                    .split('.')
                    .nth(2)
                    .and_then(|c| c.trim().parse().ok())
            })
            .unwrap_or(0)
    }
}

struct ScriptedReply {
    pattern: String,
    reply: String,
    remaining: Option<usize>,
}

struct ChamberModel {
    mode: ModeReport,
    current: f64,
    set: f64,
    high: f64,
    low: f64,
    programs: BTreeMap<u8, StoredProgram>,
    draft: Option<(u8, StoredProgram)>,
    scripted: Vec<ScriptedReply>,
    writes_before_fault: Option<usize>,
    refuse_connections: bool,
    open_delay: Duration,
    reply_latency: Duration,
    wire_log: Vec<WireEvent>,
}

impl Default for ChamberModel {
    fn default() -> Self {
        Self {
            mode: ModeReport::plain(Mode::Standby),
            current: 22.0,
            set: 23.0,
            high: 85.0,
            low: -45.0,
            programs: BTreeMap::new(),
            draft: None,
            scripted: Vec::new(),
            writes_before_fault: None,
            refuse_connections: false,
            open_delay: Duration::ZERO,
            reply_latency: Duration::ZERO,
            wire_log: Vec::new(),
        }
    }
}

impl ChamberModel {
    fn scripted_reply(&mut self, line: &str) -> Option<String> {
        let index = self
            .scripted
            .iter()
            .position(|s| line.contains(&s.pattern) && s.remaining != Some(0))?;
        let entry = &mut self.scripted[index];
        if let Some(remaining) = entry.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(entry.reply.clone())
    }

    fn respond(&mut self, line: &str) -> String {
        if let Some(reply) = self.scripted_reply(line) {
            return reply;
        }

        match line {
            "TYPE?" => MODEL_NAME.to_string(),
            "MODE?" => self.mode.to_string(),
            "TEMP?" => self.read_temperature(),
            "PRGM MON?" => self.program_monitor(),
            "POWER, ON" => {
                if self.mode.mode == Mode::Off {
                    self.mode = ModeReport::plain(Mode::Standby);
                }
                format!("OK: {}", line)
            }
            "POWER, OFF" => {
                self.mode = ModeReport::plain(Mode::Off);
                format!("OK: {}", line)
            }
            _ => {
                if let Some(mode) = line.strip_prefix("MODE, ") {
                    self.set_mode(mode, line)
                } else if let Some(values) = line.strip_prefix("TEMP, ") {
                    self.set_temperature(values, line)
                } else if let Some(rest) = line.strip_prefix("PRGM DATA WRITE, PGM: ") {
                    self.program_write(rest, line)
                } else if let Some(slot) = line.strip_prefix("PRGM ERASE, PGM: ") {
                    self.program_erase(slot, line)
                } else {
                    "NA:COMMAND ERR-1".to_string()
                }
            }
        }
    }

    fn read_temperature(&mut self) -> String {
        let target = match self.mode.mode {
            Mode::Constant => Some(self.set),
            Mode::Run => self
                .mode
                .program
                .and_then(|n| self.programs.get(&n))
                .and_then(StoredProgram::first_target),
            Mode::Off | Mode::Standby => None,
        };
        if let Some(target) = target {
            let delta = (target - self.current).clamp(-DRIFT_PER_READ, DRIFT_PER_READ);
            self.current += delta;
        }
        format!(
            "{:.1},{:.1},{:.1},{:.1}",
            self.current, self.set, self.high, self.low
        )
    }

    fn program_monitor(&self) -> String {
        match (self.mode.mode, self.mode.program) {
            (Mode::Run, Some(n)) => {
                let program = self.programs.get(&n).cloned().unwrap_or_default();
                format!(
                    "{},1,{:.1},{},{}",
                    n,
                    program.first_target().unwrap_or(self.set),
                    program.first_duration().unwrap_or_else(|| "00:00".to_string()),
                    program.cycles()
                )
            }
            _ => format!("NA:{}-2", CONTROLLER_NOT_READY),
        }
    }

    fn set_mode(&mut self, requested: &str, line: &str) -> String {
        let requested = requested.trim();
        let next = match requested {
            "OFF" => ModeReport::plain(Mode::Off),
            "STANDBY" => ModeReport::plain(Mode::Standby),
            "CONSTANT" => ModeReport::plain(Mode::Constant),
            _ => match requested
                .strip_prefix("RUN ")
                .and_then(|n| n.trim().parse::<u8>().ok())
            {
                Some(n) if self.programs.contains_key(&n) => ModeReport {
                    mode: Mode::Run,
                    program: Some(n),
                },
                Some(_) => return "NA:PROGRAM NOT READY".to_string(),
                None => return "NA:PARAMETER ERR-2".to_string(),
            },
        };
        self.mode = next;
        format!("OK: {}", line)
    }

    fn set_temperature(&mut self, values: &str, line: &str) -> String {
        let mut set = None;
        let mut high = None;
        let mut low = None;
        for field in values.split_whitespace() {
            let mut chars = field.chars();
            let tag = chars.next();
            let value = chars.as_str().parse::<f64>().ok();
            match tag {
                Some('S') => set = value,
                Some('H') => high = value,
                Some('L') => low = value,
                _ => return "NA:PARAMETER ERR-2".to_string(),
            }
        }
        match (set, high, low) {
            (Some(s), Some(h), Some(l)) if l <= s && s <= h => {
                self.set = s;
                self.high = h;
                self.low = l;
                format!("OK: {}", line)
            }
            _ => "NA:PARAMETER ERR-3".to_string(),
        }
    }

    fn program_write(&mut self, rest: &str, line: &str) -> String {
        let Some((slot, body)) = rest.split_once(", ") else {
            return "NA:PARAMETER ERR-2".to_string();
        };
        let Ok(slot) = slot.trim().parse::<u8>() else {
            return "NA:PARAMETER ERR-2".to_string();
        };

        match body {
            "EDIT START" => {
                let running_slot = self.mode.mode == Mode::Run && self.mode.program == Some(slot);
                if self.draft.is_some() || running_slot {
                    return "NA:PROGRAM PROTECTED".to_string();
                }
                self.draft = Some((slot, StoredProgram::default()));
            }
            "EDIT END" => match self.draft.take() {
                Some((n, program)) if n == slot => {
                    self.programs.insert(n, program);
                }
                other => {
                    self.draft = other;
                    return "NA:EDIT NOT STARTED".to_string();
                }
            },
            "EDIT CANCEL" => match self.draft.take() {
                Some((n, _)) if n == slot => {}
                other => {
                    self.draft = other;
                    return "NA:EDIT NOT STARTED".to_string();
                }
            },
            _ => match self.draft.as_mut() {
                Some((n, program)) if *n == slot => program.directives.push(body.to_string()),
                _ => return "NA:EDIT NOT STARTED".to_string(),
            },
        }
        format!("OK: {}", line)
    }

    fn program_erase(&mut self, slot: &str, line: &str) -> String {
        let Ok(slot) = slot.trim().parse::<u8>() else {
            return "NA:PARAMETER ERR-2".to_string();
        };
        if matches!(self.draft, Some((n, _)) if n == slot) {
            return "NA:PROGRAM PROTECTED".to_string();
        }
        self.programs.remove(&slot);
        format!("OK: {}", line)
    }
}

/// Shared handle to a simulated chamber
///
/// Clones share the same instrument state, so a test can keep one handle for
/// inspection while the session owns a transport opened from another.
#[derive(Clone, Default)]
pub struct SimulatedChamber {
    model: Arc<Mutex<ChamberModel>>,
}

impl SimulatedChamber {
    /// Create a chamber in STANDBY at 22 °C
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&self) -> MutexGuard<'_, ChamberModel> {
        self.model.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start in the given mode
    pub fn with_mode(self, mode: ModeReport) -> Self {
        self.model().mode = mode;
        self
    }

    /// Delay every reply by `latency`
    pub fn with_reply_latency(self, latency: Duration) -> Self {
        self.model().reply_latency = latency;
        self
    }

    /// Delay opening a connection by `delay`
    pub fn with_open_delay(self, delay: Duration) -> Self {
        self.model().open_delay = delay;
        self
    }

    /// Store a program as if it had been written earlier
    pub fn with_program(self, slot: u8, directives: &[&str]) -> Self {
        self.model().programs.insert(
            slot,
            StoredProgram {
                directives: directives.iter().map(|d| d.to_string()).collect(),
            },
        );
        self
    }

    /// Answer every line containing `pattern` with `reply`, without acting on it
    pub fn script_reply(&self, pattern: &str, reply: &str) {
        self.push_script(pattern, reply, None);
    }

    /// Answer the next `times` lines containing `pattern` with `reply`
    pub fn script_reply_times(&self, pattern: &str, reply: &str, times: usize) {
        self.push_script(pattern, reply, Some(times));
    }

    /// Reject every line containing `pattern` with `NOK`
    pub fn reject(&self, pattern: &str) {
        self.script_reply(pattern, "NOK");
    }

    fn push_script(&self, pattern: &str, reply: &str, remaining: Option<usize>) {
        self.model().scripted.push(ScriptedReply {
            pattern: pattern.to_string(),
            reply: reply.to_string(),
            remaining,
        });
    }

    /// Break the wire after `writes` more successful writes
    pub fn fail_transport_after(&self, writes: usize) {
        self.model().writes_before_fault = Some(writes);
    }

    /// Refuse new connections
    pub fn refuse_connections(&self) {
        self.model().refuse_connections = true;
    }

    /// Every line written and read so far, in order
    pub fn wire_log(&self) -> Vec<WireEvent> {
        self.model().wire_log.clone()
    }

    /// Lines written so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.model()
            .wire_log
            .iter()
            .filter_map(|event| match event {
                WireEvent::Write(line) => Some(line.clone()),
                WireEvent::Read(_) => None,
            })
            .collect()
    }

    /// Forget the wire log
    pub fn clear_log(&self) {
        self.model().wire_log.clear();
    }

    /// Current mode
    pub fn mode(&self) -> ModeReport {
        self.model().mode
    }

    /// Current set point
    pub fn set_point(&self) -> f64 {
        self.model().set
    }

    /// Committed program in `slot`
    pub fn program(&self, slot: u8) -> Option<StoredProgram> {
        self.model().programs.get(&slot).cloned()
    }

    /// Whether an edit envelope is open
    pub fn edit_open(&self) -> bool {
        self.model().draft.is_some()
    }
}

#[async_trait]
impl Connector for SimulatedChamber {
    async fn open(&self, address: &str) -> Result<Box<dyn Transport>, ChamberError> {
        let (refuse, delay) = {
            let model = self.model();
            (model.refuse_connections, model.open_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if refuse {
            return Err(TransportError::Open {
                address: address.to_string(),
                reason: "no instrument at address".to_string(),
            }
            .into());
        }
        Ok(Box::new(SimulatedTransport {
            chamber: self.clone(),
            description: format!("simulated {} at {}", MODEL_NAME, address),
            pending: None,
        }))
    }
}

struct SimulatedTransport {
    chamber: SimulatedChamber,
    description: String,
    pending: Option<String>,
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn write(&mut self, line: &str) -> Result<(), TransportError> {
        let latency = {
            let mut model = self.chamber.model();
            match model.writes_before_fault.as_mut() {
                Some(0) => return Err(TransportError::Closed),
                Some(remaining) => *remaining -= 1,
                None => {}
            }
            model.wire_log.push(WireEvent::Write(line.to_string()));
            self.pending = Some(model.respond(line.trim()));
            model.reply_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        let reply = self.pending.take().ok_or(TransportError::NoResponse)?;
        self.chamber
            .model()
            .wire_log
            .push(WireEvent::Read(reply.clone()));
        Ok(reply)
    }

    fn describe(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(transport: &mut Box<dyn Transport>, line: &str) -> String {
        transport.write(line).await.unwrap();
        transport.read().await.unwrap()
    }

    #[tokio::test]
    async fn test_constant_mode_and_set_point() {
        let chamber = SimulatedChamber::new();
        let mut transport = chamber.open("SIM").await.unwrap();

        assert_eq!(exchange(&mut transport, "MODE?").await, "STANDBY");
        assert!(exchange(&mut transport, "MODE, CONSTANT").await.starts_with("OK"));
        assert!(exchange(&mut transport, "TEMP, S30.0 H85.0 L-45.0")
            .await
            .starts_with("OK"));
        assert_eq!(chamber.set_point(), 30.0);
        assert_eq!(exchange(&mut transport, "TEMP?").await, "22.5,30.0,85.0,-45.0");
    }

    #[tokio::test]
    async fn test_program_envelope() {
        let chamber = SimulatedChamber::new();
        let mut transport = chamber.open("SIM").await.unwrap();

        let body = "PRGM DATA WRITE, PGM: 1, STEP1, TIME00:30";
        assert!(exchange(&mut transport, body).await.starts_with("NA"));

        exchange(&mut transport, "PRGM DATA WRITE, PGM: 1, EDIT START").await;
        assert!(chamber.edit_open());
        exchange(&mut transport, body).await;
        assert!(chamber.program(1).is_none());
        exchange(&mut transport, "PRGM DATA WRITE, PGM: 1, EDIT END").await;

        assert!(!chamber.edit_open());
        assert_eq!(chamber.program(1).unwrap().directives, vec!["STEP1, TIME00:30"]);
    }

    #[tokio::test]
    async fn test_program_monitor_when_idle() {
        let chamber = SimulatedChamber::new();
        let mut transport = chamber.open("SIM").await.unwrap();
        assert_eq!(
            exchange(&mut transport, "PRGM MON?").await,
            "NA:CONTROLLER NOT READY-2"
        );
    }

    #[tokio::test]
    async fn test_run_requires_stored_program() {
        let chamber = SimulatedChamber::new().with_program(
            2,
            &["STEP1, TEMP40.0, TRAMP ON, TIME00:15", "COUNT, (1. 1. 3)"],
        );
        let mut transport = chamber.open("SIM").await.unwrap();

        assert!(exchange(&mut transport, "MODE, RUN 1").await.starts_with("NA"));
        assert!(exchange(&mut transport, "MODE, RUN 2").await.starts_with("OK"));
        assert_eq!(exchange(&mut transport, "MODE?").await, "RUN 2");
        assert_eq!(exchange(&mut transport, "PRGM MON?").await, "2,1,40.0,00:15,3");
    }

    #[tokio::test]
    async fn test_scripted_reply_is_consumed() {
        let chamber = SimulatedChamber::new();
        chamber.script_reply_times("POWER", "OK: ERR-4", 1);
        let mut transport = chamber.open("SIM").await.unwrap();

        assert_eq!(exchange(&mut transport, "POWER, OFF").await, "OK: ERR-4");
        assert_eq!(chamber.mode().mode, Mode::Standby);
        assert_eq!(exchange(&mut transport, "POWER, OFF").await, "OK: POWER, OFF");
        assert_eq!(chamber.mode().mode, Mode::Off);
    }

    #[tokio::test]
    async fn test_transport_fault_injection() {
        let chamber = SimulatedChamber::new();
        chamber.fail_transport_after(1);
        let mut transport = chamber.open("SIM").await.unwrap();

        exchange(&mut transport, "TYPE?").await;
        assert!(matches!(
            transport.write("TYPE?").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_read_without_write_fails() {
        let chamber = SimulatedChamber::new();
        let mut transport = chamber.open("SIM").await.unwrap();
        assert!(matches!(
            transport.read().await,
            Err(TransportError::NoResponse)
        ));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let chamber = SimulatedChamber::new();
        chamber.refuse_connections();
        assert!(chamber.open("SIM").await.is_err());
    }
}
