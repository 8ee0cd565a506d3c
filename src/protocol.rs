//! SU-241 line protocol
//!
//! Pure encoding of commands and classification/parsing of replies. Nothing
//! in here touches a transport; `session` performs the exchanges.
//!
//! Every exchange is one ASCII line out and one line back. Command replies are
//! acknowledgements (`OK: ...` or an error text), query replies carry data or
//! start with `NOK` on failure.

use crate::program::{EndAction, ProgramSlot, ProgramStep, RepeatSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reply text the instrument sends for `PRGM MON?` when nothing is running.
pub const CONTROLLER_NOT_READY: &str = "CONTROLLER NOT READY";

/// Operating mode of the chamber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Power off, no control
    Off,
    /// Powered, not controlling temperature
    Standby,
    /// Holding a constant set point
    Constant,
    /// Executing a stored program
    Run,
}

impl Mode {
    /// Literal used on the wire for this mode
    pub fn wire_literal(&self) -> &'static str {
        match self {
            Mode::Off => "OFF",
            Mode::Standby => "STANDBY",
            Mode::Constant => "CONSTANT",
            Mode::Run => "RUN",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_literal())
    }
}

/// Error returned when a reply cannot be understood
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised reply '{reply}' ({expected})")]
pub struct ParseReplyError {
    /// Reply as received, trimmed
    pub reply: String,
    /// What the parser was looking for
    pub expected: &'static str,
}

impl ParseReplyError {
    fn new(reply: &str, expected: &'static str) -> Self {
        Self {
            reply: reply.trim().to_string(),
            expected,
        }
    }
}

/// Mode as reported by `MODE?`, with the running program when in RUN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeReport {
    /// Operating mode
    pub mode: Mode,
    /// Program slot, only in RUN
    pub program: Option<u8>,
}

impl ModeReport {
    /// Report for a mode without a program number
    pub fn plain(mode: Mode) -> Self {
        Self {
            mode,
            program: None,
        }
    }

    /// Whether a program is executing
    pub fn is_running(&self) -> bool {
        self.mode == Mode::Run
    }
}

impl FromStr for ModeReport {
    type Err = ParseReplyError;

    /// Parses replies such as `CONSTANT`, `STANDBY\r\n` or `RUN 3`.
    fn from_str(reply: &str) -> Result<Self, Self::Err> {
        let text = reply.trim().to_ascii_uppercase();
        // STANDBY and CONSTANT are tested before RUN/OFF so that keyword
        // containment never picks the wrong mode.
        let mode = if text.contains("STANDBY") {
            Mode::Standby
        } else if text.contains("CONSTANT") {
            Mode::Constant
        } else if text.contains("RUN") {
            Mode::Run
        } else if text.contains("OFF") {
            Mode::Off
        } else {
            return Err(ParseReplyError::new(reply, "mode keyword"));
        };

        let program = if mode == Mode::Run {
            text.split(|c: char| !c.is_ascii_digit())
                .find(|s| !s.is_empty())
                .and_then(|digits| digits.parse().ok())
        } else {
            None
        };

        Ok(Self { mode, program })
    }
}

impl fmt::Display for ModeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.program {
            Some(n) => write!(f, "{} {}", self.mode, n),
            None => write!(f, "{}", self.mode),
        }
    }
}

/// Outcome of a command exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Ack {
    /// `OK` with no error marker
    Ok,
    /// Anything else
    Nok,
}

impl Ack {
    /// Classify a command reply.
    ///
    /// Success requires an `OK` prefix *and* no `ERR-` anywhere in the text.
    pub fn classify(reply: &str) -> Self {
        let reply = reply.trim_start();
        if reply.starts_with("OK") && !reply.contains("ERR-") {
            Ack::Ok
        } else {
            Ack::Nok
        }
    }

    /// `true` for `Ack::Ok`
    pub fn is_ok(&self) -> bool {
        matches!(self, Ack::Ok)
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ack::Ok => f.write_str("OK"),
            Ack::Nok => f.write_str("NOK"),
        }
    }
}

/// Classify a query reply: `None` is the failure sentinel.
pub fn classify_query(reply: &str) -> Option<String> {
    let trimmed = reply.trim();
    if trimmed.starts_with("NOK") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Instantaneous temperature snapshot from `TEMP?`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Measured temperature
    pub current: f64,
    /// Set point
    pub set: f64,
    /// High limit
    pub high: f64,
    /// Low limit
    pub low: f64,
}

impl FromStr for Reading {
    type Err = ParseReplyError;

    fn from_str(reply: &str) -> Result<Self, Self::Err> {
        let values = reply
            .trim()
            .split(',')
            .map(|field| field.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ParseReplyError::new(reply, "four comma-separated numbers"))?;

        match values.as_slice() {
            [current, set, high, low] => Ok(Self {
                current: *current,
                set: *set,
                high: *high,
                low: *low,
            }),
            _ => Err(ParseReplyError::new(reply, "four comma-separated numbers")),
        }
    }
}

/// High and low alarm limits sent with every constant set point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureLimits {
    /// Upper limit
    pub high: f64,
    /// Lower limit
    pub low: f64,
}

impl Default for TemperatureLimits {
    fn default() -> Self {
        Self {
            high: 85.0,
            low: -45.0,
        }
    }
}

impl TemperatureLimits {
    /// Whether `set` lies within the limits
    pub fn admits(&self, set: f64) -> bool {
        self.low <= set && set <= self.high
    }
}

/// Program monitor report from `PRGM MON?`
///
/// Fields are kept as the instrument reported them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramStatus {
    /// Running program slot
    pub program_number: String,
    /// Current step
    pub current_step: String,
    /// Target of the current step
    pub target_temp: String,
    /// Time left in the current step
    pub step_time_remaining: String,
    /// Repeat cycles left, as reported
    pub repeat_cycles_remaining: String,
}

impl ProgramStatus {
    /// All-zero sentinel meaning "no program running"
    pub fn idle() -> Self {
        Self {
            program_number: "0".to_string(),
            current_step: "0".to_string(),
            target_temp: "0".to_string(),
            step_time_remaining: "0".to_string(),
            repeat_cycles_remaining: "0".to_string(),
        }
    }

    /// Whether this is the idle sentinel
    pub fn is_idle(&self) -> bool {
        *self == Self::idle()
    }

    /// Cycle count with every non-word character removed, as written to the log
    pub fn cycles_for_log(&self) -> String {
        self.repeat_cycles_remaining
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect()
    }
}

impl FromStr for ProgramStatus {
    type Err = ParseReplyError;

    fn from_str(reply: &str) -> Result<Self, Self::Err> {
        if reply.contains(CONTROLLER_NOT_READY) {
            return Ok(Self::idle());
        }

        let fields: Vec<&str> = reply.trim().split(',').map(str::trim).collect();
        if fields.len() < 5 {
            return Err(ParseReplyError::new(reply, "five comma-separated fields"));
        }

        Ok(Self {
            program_number: fields[0].to_string(),
            current_step: fields[1].to_string(),
            target_temp: fields[2].to_string(),
            step_time_remaining: fields[3].to_string(),
            repeat_cycles_remaining: fields[4].to_string(),
        })
    }
}

/// Directive inside a `PRGM DATA WRITE` envelope
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramDirective {
    /// Open the envelope
    EditStart,
    /// One step
    Step {
        /// 1-based step number
        index: usize,
        /// Step contents
        step: ProgramStep,
    },
    /// Repeat a range of steps
    Count(RepeatSpec),
    /// Action after the last step
    End(EndAction),
    /// Commit the envelope
    EditEnd,
    /// Discard the envelope
    EditCancel,
}

impl fmt::Display for ProgramDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramDirective::EditStart => f.write_str("EDIT START"),
            ProgramDirective::Step { index, step } => match step {
                ProgramStep::Ramp {
                    target,
                    ramp,
                    duration,
                } => write!(
                    f,
                    "STEP{}, TEMP{:.1}, TRAMP {}, TIME{}",
                    index,
                    target,
                    if *ramp { "ON" } else { "OFF" },
                    duration
                ),
                ProgramStep::Hold { duration } => write!(f, "STEP{}, TIME{}", index, duration),
            },
            ProgramDirective::Count(repeat) => write!(
                f,
                "COUNT, ({}. {}. {})",
                repeat.from_step, repeat.to_step, repeat.cycles
            ),
            ProgramDirective::End(action) => write!(f, "END, {}", action.wire_literal()),
            ProgramDirective::EditEnd => f.write_str("EDIT END"),
            ProgramDirective::EditCancel => f.write_str("EDIT CANCEL"),
        }
    }
}

/// Every line the driver sends
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `TYPE?`
    Identify,
    /// `MODE?`
    QueryMode,
    /// `TEMP?`
    QueryTemperature,
    /// `PRGM MON?`
    ProgramMonitor,
    /// `MODE, <mode>`
    SetMode(Mode),
    /// `MODE, RUN <slot>`
    RunProgram(ProgramSlot),
    /// `POWER, ON`
    PowerOn,
    /// `POWER, OFF`
    PowerOff,
    /// `TEMP, S.. H.. L..`
    SetTemperature {
        /// Set point
        set: f64,
        /// High limit
        high: f64,
        /// Low limit
        low: f64,
    },
    /// `PRGM DATA WRITE, PGM: <slot>, <directive>`
    ProgramWrite {
        /// Target slot
        slot: ProgramSlot,
        /// Line inside the envelope
        directive: ProgramDirective,
    },
    /// `PRGM ERASE, PGM: <slot>`
    ProgramErase(ProgramSlot),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Identify => f.write_str("TYPE?"),
            Command::QueryMode => f.write_str("MODE?"),
            Command::QueryTemperature => f.write_str("TEMP?"),
            Command::ProgramMonitor => f.write_str("PRGM MON?"),
            Command::SetMode(mode) => write!(f, "MODE, {}", mode),
            Command::RunProgram(slot) => write!(f, "MODE, RUN {}", slot),
            Command::PowerOn => f.write_str("POWER, ON"),
            Command::PowerOff => f.write_str("POWER, OFF"),
            Command::SetTemperature { set, high, low } => {
                write!(f, "TEMP, S{:.1} H{:.1} L{:.1}", set, high, low)
            }
            Command::ProgramWrite { slot, directive } => {
                write!(f, "PRGM DATA WRITE, PGM: {}, {}", slot, directive)
            }
            Command::ProgramErase(slot) => write!(f, "PRGM ERASE, PGM: {}", slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::StepDuration;

    #[test]
    fn test_ack_requires_ok_prefix() {
        assert_eq!(Ack::classify("OK: MODE, CONSTANT"), Ack::Ok);
        assert_eq!(Ack::classify("NOK"), Ack::Nok);
        assert_eq!(Ack::classify("NA:DATA NOT READY"), Ack::Nok);
        assert_eq!(Ack::classify(""), Ack::Nok);
    }

    #[test]
    fn test_ack_err_marker_overrides_ok_prefix() {
        assert_eq!(Ack::classify("OK: ERR-3"), Ack::Nok);
        assert_eq!(Ack::classify("OK:TEMP ERR-1 OUT OF RANGE"), Ack::Nok);
    }

    #[test]
    fn test_query_nok_is_sentinel() {
        assert_eq!(classify_query("NOK"), None);
        assert_eq!(classify_query("NOK:whatever"), None);
        assert_eq!(classify_query("CONSTANT\r\n"), Some("CONSTANT".to_string()));
    }

    #[test]
    fn test_reading_parses_four_fields() {
        let reading: Reading = "23.5,25.0,85.0,-45.0".parse().unwrap();
        assert_eq!(
            reading,
            Reading {
                current: 23.5,
                set: 25.0,
                high: 85.0,
                low: -45.0
            }
        );
    }

    #[test]
    fn test_reading_rejects_garbage() {
        assert!("23.5,25.0,85.0".parse::<Reading>().is_err());
        assert!("NOK".parse::<Reading>().is_err());
        assert!("23.5,abc,85.0,-45.0".parse::<Reading>().is_err());
    }

    #[test]
    fn test_program_status_not_ready_is_idle() {
        let status: ProgramStatus = "NA:CONTROLLER NOT READY-2".parse().unwrap();
        assert!(status.is_idle());
    }

    #[test]
    fn test_program_status_fields() {
        let status: ProgramStatus = "1,3,-40.0,0:42,(2)".parse().unwrap();
        assert_eq!(status.program_number, "1");
        assert_eq!(status.current_step, "3");
        assert_eq!(status.target_temp, "-40.0");
        assert_eq!(status.step_time_remaining, "0:42");
        assert_eq!(status.cycles_for_log(), "2");
        assert!(!status.is_idle());
    }

    #[test]
    fn test_mode_report_parsing() {
        assert_eq!(
            "CONSTANT\r\n".parse::<ModeReport>().unwrap(),
            ModeReport::plain(Mode::Constant)
        );
        assert_eq!(
            "STANDBY".parse::<ModeReport>().unwrap(),
            ModeReport::plain(Mode::Standby)
        );
        assert_eq!(
            "OFF".parse::<ModeReport>().unwrap(),
            ModeReport::plain(Mode::Off)
        );
        let run = "RUN 3".parse::<ModeReport>().unwrap();
        assert_eq!(run.mode, Mode::Run);
        assert_eq!(run.program, Some(3));
        assert!(run.is_running());
        assert!("WHAT".parse::<ModeReport>().is_err());
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::SetMode(Mode::Constant).to_string(), "MODE, CONSTANT");
        assert_eq!(
            Command::SetTemperature {
                set: 23.0,
                high: 85.0,
                low: -45.0
            }
            .to_string(),
            "TEMP, S23.0 H85.0 L-45.0"
        );
        assert_eq!(
            Command::RunProgram(ProgramSlot::default()).to_string(),
            "MODE, RUN 1"
        );
        assert_eq!(Command::PowerOff.to_string(), "POWER, OFF");
    }

    #[test]
    fn test_program_directive_encoding() {
        let slot = ProgramSlot::new(2).unwrap();
        let ramp = Command::ProgramWrite {
            slot,
            directive: ProgramDirective::Step {
                index: 1,
                step: ProgramStep::Ramp {
                    target: 60.0,
                    ramp: true,
                    duration: StepDuration::new(1, 30).unwrap(),
                },
            },
        };
        assert_eq!(
            ramp.to_string(),
            "PRGM DATA WRITE, PGM: 2, STEP1, TEMP60.0, TRAMP ON, TIME01:30"
        );

        let hold = ProgramDirective::Step {
            index: 2,
            step: ProgramStep::Hold {
                duration: StepDuration::new(0, 5).unwrap(),
            },
        };
        assert_eq!(hold.to_string(), "STEP2, TIME00:05");

        let count = ProgramDirective::Count(RepeatSpec {
            from_step: 1,
            to_step: 4,
            cycles: 2,
        });
        assert_eq!(count.to_string(), "COUNT, (1. 4. 2)");
        assert_eq!(ProgramDirective::End(EndAction::Hold).to_string(), "END, HOLD");
    }
}
