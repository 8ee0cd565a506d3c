//! Operator command surface
//!
//! Text commands typed at the `chamberctl` console, and the [`Console`] that
//! turns them into session and program-author calls. Each command returns an
//! [`Outcome`] for the shell to show; only transport and persistence faults
//! come back as errors.
//!
//! | Command              | Effect                                      |
//! |----------------------|---------------------------------------------|
//! | `constant <t>`       | `MODE, CONSTANT` then set point `t`         |
//! | `standby` / `on`     | `MODE, STANDBY`                             |
//! | `off`                | `POWER, OFF`                                |
//! | `ramp [slot]`        | write the configured ramp program           |
//! | `run [slot]`         | start a stored program                      |
//! | `stop`               | back to STANDBY, after confirmation         |
//! | `identify`           | `TYPE?`                                     |
//! | `status`             | fresh `MODE?`                               |
//! | `raw <line>`         | send a line verbatim                        |
//! | `quit`               | leave; the chamber keeps its mode           |
//!
//! Omitted slots default to 1.

use crate::config::Settings;
use crate::error::{AppResult, ChamberError};
use crate::program::{ProgramAuthor, ProgramSlot, ProgramWrite, RampProgram};
use crate::protocol::{Ack, Mode, ModeReport, TemperatureLimits};
use crate::session::{ChamberSession, RunOutcome};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Question asked before stopping a running program
pub const STOP_CONFIRMATION: &str = "Are you sure you want to stop the program?";

/// A parsed operator command
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    /// Open the session
    Connect,
    /// Hold a constant temperature
    SetConstant(f64),
    /// Enter STANDBY
    Standby,
    /// Power the chamber off
    PowerOff,
    /// Write the configured profile to a slot
    AuthorProgram(Option<u8>),
    /// Start a stored program
    RunProgram(Option<u8>),
    /// Stop the running program
    StopProgram,
    /// Query the instrument type
    Identify,
    /// Query the mode
    Status,
    /// Send a line verbatim
    Raw(String),
    /// List commands
    Help,
    /// Leave the console
    Quit,
}

fn optional_slot(arg: Option<&str>) -> Result<Option<u8>, ChamberError> {
    arg.map(|s| {
        s.parse::<u8>()
            .map_err(|_| ChamberError::InvalidCommand(format!("'{}' is not a program number", s)))
    })
    .transpose()
}

impl FromStr for OperatorCommand {
    type Err = ChamberError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, Some(rest.trim()).filter(|r| !r.is_empty())),
            None => (line, None),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "connect" => OperatorCommand::Connect,
            "constant" | "set" => {
                let value = rest.ok_or_else(|| {
                    ChamberError::InvalidCommand("constant needs a temperature".to_string())
                })?;
                let temperature = value.parse::<f64>().map_err(|_| {
                    ChamberError::InvalidCommand(format!("'{}' is not a valid temperature", value))
                })?;
                if !temperature.is_finite() {
                    return Err(ChamberError::InvalidCommand(format!(
                        "'{}' is not a valid temperature",
                        value
                    )));
                }
                OperatorCommand::SetConstant(temperature)
            }
            "standby" | "on" => OperatorCommand::Standby,
            "off" => OperatorCommand::PowerOff,
            "ramp" | "author" => OperatorCommand::AuthorProgram(optional_slot(rest)?),
            "run" => OperatorCommand::RunProgram(optional_slot(rest)?),
            "stop" => OperatorCommand::StopProgram,
            "identify" | "type" => OperatorCommand::Identify,
            "status" => OperatorCommand::Status,
            "raw" => OperatorCommand::Raw(
                rest.ok_or_else(|| ChamberError::InvalidCommand("raw needs a line".to_string()))?
                    .to_string(),
            ),
            "help" | "?" => OperatorCommand::Help,
            "quit" | "exit" => OperatorCommand::Quit,
            "" => return Err(ChamberError::InvalidCommand("empty command".to_string())),
            other => {
                return Err(ChamberError::InvalidCommand(format!(
                    "unknown command '{}'",
                    other
                )))
            }
        };
        Ok(command)
    }
}

/// What the shell shows after a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// The chamber accepted the action
    Success(String),
    /// Refused locally or by the chamber
    Failure(String),
    /// The operator declined the confirmation
    Cancelled,
    /// The operator asked to leave
    Quit,
}

impl Outcome {
    fn from_ack(ack: Ack, success: &str, failure: &str) -> Self {
        match ack {
            Ack::Ok => Outcome::Success(success.to_string()),
            Ack::Nok => Outcome::Failure(failure.to_string()),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(text) => write!(f, "ok: {}", text),
            Outcome::Failure(text) => write!(f, "failed: {}", text),
            Outcome::Cancelled => f.write_str("cancelled"),
            Outcome::Quit => f.write_str("bye"),
        }
    }
}

/// Operator actions valid in a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Affordances {
    /// `standby` is offered
    pub standby: bool,
    /// `off` is offered
    pub power_off: bool,
    /// `run` is offered (otherwise `stop` is)
    pub run_program: bool,
    /// `stop` is offered
    pub stop_program: bool,
}

impl Affordances {
    /// Actions for `mode`; everything is offered when the mode is unknown
    pub fn for_mode(mode: Option<Mode>) -> Self {
        match mode {
            Some(Mode::Off) => Self {
                standby: true,
                power_off: false,
                run_program: true,
                stop_program: false,
            },
            Some(Mode::Standby) => Self {
                standby: false,
                power_off: true,
                run_program: true,
                stop_program: false,
            },
            Some(Mode::Run) => Self {
                standby: true,
                power_off: true,
                run_program: false,
                stop_program: true,
            },
            Some(Mode::Constant) | None => Self {
                standby: true,
                power_off: true,
                run_program: true,
                stop_program: mode.is_none(),
            },
        }
    }

    /// Whether `command` is offered
    pub fn permits(&self, command: &OperatorCommand) -> bool {
        match command {
            OperatorCommand::Standby => self.standby,
            OperatorCommand::PowerOff => self.power_off,
            OperatorCommand::RunProgram(_) => self.run_program,
            OperatorCommand::StopProgram => self.stop_program,
            _ => true,
        }
    }
}

/// Executes operator commands against a connected session
pub struct Console {
    session: ChamberSession,
    limits: TemperatureLimits,
    author: ProgramAuthor,
    profile: RampProgram,
    max_slot: u8,
}

impl Console {
    /// Console over `session` with limits, profile and slots from `settings`
    pub fn new(session: ChamberSession, settings: &Settings) -> Self {
        Self {
            session,
            limits: settings.limits,
            author: ProgramAuthor::new(settings.program.abort_strategy),
            profile: settings.program.profile.clone(),
            max_slot: settings.program.max_slot,
        }
    }

    /// The underlying session
    pub fn session(&self) -> &ChamberSession {
        &self.session
    }

    /// Actions offered in the last known mode
    pub fn affordances(&self) -> Affordances {
        Affordances::for_mode(self.session.last_known_mode().map(|m| m.mode))
    }

    fn slot(&self, number: Option<u8>) -> AppResult<ProgramSlot> {
        match number {
            None => Ok(ProgramSlot::default()),
            Some(n) => ProgramSlot::new(n)
                .ok_or_else(|| ChamberError::InvalidCommand("program slots start at 1".to_string()))?
                .check_max(self.max_slot),
        }
    }

    /// Run one command.
    ///
    /// `confirm` is asked before destructive actions and may decline them.
    pub async fn execute<F>(&self, command: &OperatorCommand, confirm: F) -> AppResult<Outcome>
    where
        F: FnOnce(&str) -> bool,
    {
        if !self.affordances().permits(command) {
            let mode = self
                .session
                .last_known_mode()
                .map_or_else(|| "unknown".to_string(), |m| m.to_string());
            return Ok(Outcome::Failure(format!("not available in mode {}", mode)));
        }

        let outcome = match command {
            OperatorCommand::Connect => Outcome::Success(format!(
                "already connected to {}",
                self.session.address()
            )),
            OperatorCommand::SetConstant(temperature) => self.set_constant(*temperature).await?,
            OperatorCommand::Standby => Outcome::from_ack(
                self.session.set_mode(Mode::Standby).await?,
                "chamber in STANDBY",
                "chamber refused STANDBY",
            ),
            OperatorCommand::PowerOff => Outcome::from_ack(
                self.session.power_off().await?,
                "chamber powered off",
                "chamber refused power off",
            ),
            OperatorCommand::AuthorProgram(number) => {
                let slot = match self.slot(*number) {
                    Ok(slot) => slot,
                    Err(e) => return Ok(Outcome::Failure(e.to_string())),
                };
                self.author_program(slot).await?
            }
            OperatorCommand::RunProgram(number) => {
                let slot = match self.slot(*number) {
                    Ok(slot) => slot,
                    Err(e) => return Ok(Outcome::Failure(e.to_string())),
                };
                match self.session.run_program(slot).await? {
                    RunOutcome::Started(mode) => Outcome::Success(format!("chamber in {}", mode)),
                    RunOutcome::NotConfirmed(mode) => Outcome::Failure(format!(
                        "program {} accepted but chamber reports {}",
                        slot,
                        mode.map_or_else(|| "no mode".to_string(), |m| m.to_string())
                    )),
                    RunOutcome::Rejected => {
                        Outcome::Failure(format!("chamber refused to run program {}", slot))
                    }
                }
            }
            OperatorCommand::StopProgram => {
                if !confirm(STOP_CONFIRMATION) {
                    return Ok(Outcome::Cancelled);
                }
                Outcome::from_ack(
                    self.session.set_mode(Mode::Standby).await?,
                    "program stopped, chamber in STANDBY",
                    "chamber refused to stop the program",
                )
            }
            OperatorCommand::Identify => match self.session.identify().await? {
                Some(model) => Outcome::Success(model),
                None => Outcome::Failure("identification query rejected".to_string()),
            },
            OperatorCommand::Status => match self.session.mode().await? {
                Some(mode) => Outcome::Success(describe_mode(mode)),
                None => Outcome::Failure("mode query rejected".to_string()),
            },
            OperatorCommand::Raw(line) => self.raw(line).await?,
            OperatorCommand::Help => Outcome::Success(
                "connect, constant <t>, standby, off, ramp [n], run [n], stop, identify, status, raw <line>, quit"
                    .to_string(),
            ),
            OperatorCommand::Quit => Outcome::Quit,
        };

        info!(command = ?command, outcome = %outcome, "Operator command");
        Ok(outcome)
    }

    async fn set_constant(&self, temperature: f64) -> AppResult<Outcome> {
        if !self.limits.admits(temperature) {
            return Ok(Outcome::Failure(format!(
                "{:.1} is outside the limits {:.1}..{:.1}",
                temperature, self.limits.low, self.limits.high
            )));
        }

        let mut exchange = self.session.exclusive().await;
        if exchange.set_mode(Mode::Constant).await? == Ack::Nok {
            return Ok(Outcome::Failure("chamber refused CONSTANT mode".to_string()));
        }
        let ack = exchange.set_temperature(temperature, self.limits).await?;
        Ok(Outcome::from_ack(
            ack,
            &format!("holding {:.1}", temperature),
            &format!("chamber refused set point {:.1}", temperature),
        ))
    }

    async fn author_program(&self, slot: ProgramSlot) -> AppResult<Outcome> {
        let outcome = match self.author.write(&self.session, slot, &self.profile).await {
            Ok(ProgramWrite::Committed) => {
                Outcome::Success(format!("program {} written", slot))
            }
            Ok(ProgramWrite::Refused) => Outcome::Failure(format!(
                "program {} could not be opened for editing; make sure it is not running",
                slot
            )),
            Ok(ProgramWrite::Aborted { directive, cleanup }) => Outcome::Failure(format!(
                "program {} rejected at '{}'{}",
                slot,
                directive,
                if cleanup.is_clean() {
                    ""
                } else {
                    "; closing the edit did not fully succeed"
                }
            )),
            Err(ChamberError::InvalidProgram(reason)) => {
                Outcome::Failure(format!("invalid program: {}", reason))
            }
            Err(e) => return Err(e),
        };
        Ok(outcome)
    }

    async fn raw(&self, line: &str) -> AppResult<Outcome> {
        if line.trim_end().ends_with('?') {
            Ok(match self.session.query(line).await? {
                Some(reply) => Outcome::Success(reply),
                None => Outcome::Failure("NOK".to_string()),
            })
        } else {
            Ok(Outcome::from_ack(
                self.session.send(line).await?,
                "OK",
                "NOK",
            ))
        }
    }
}

fn describe_mode(mode: ModeReport) -> String {
    let affordances = Affordances::for_mode(Some(mode.mode));
    format!(
        "mode {}; {}",
        mode,
        if affordances.stop_program {
            "program running"
        } else {
            "no program running"
        }
    )
}
