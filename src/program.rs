//! Ramp programs and the program author
//!
//! A [`RampProgram`] is a list of steps, an optional repeat range and an end
//! action. [`ProgramAuthor`] writes it into a program slot inside the
//! `EDIT START` / `EDIT END` envelope, holding the session for the whole
//! envelope so no other exchange can land between its directives.
//!
//! If any directive is rejected the envelope is closed according to the
//! configured [`AbortStrategy`]; the instrument is never left in edit mode.

use crate::error::{AppResult, ChamberError};
use crate::protocol::{Ack, Command, ProgramDirective};
use crate::session::{ChamberSession, Exchange};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU8;
use std::str::FromStr;
use tracing::{info, warn};

/// Most steps a single program may hold
pub const MAX_STEPS: usize = 99;

/// Program storage slot on the instrument (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ProgramSlot(NonZeroU8);

impl ProgramSlot {
    /// Slot `number`; `None` for zero
    pub fn new(number: u8) -> Option<Self> {
        NonZeroU8::new(number).map(Self)
    }

    /// Slot number as sent on the wire
    pub fn get(&self) -> u8 {
        self.0.get()
    }

    /// Reject slots above the instrument's highest slot
    pub fn check_max(self, max_slot: u8) -> AppResult<Self> {
        if self.get() > max_slot {
            return Err(ChamberError::InvalidCommand(format!(
                "program slot {} exceeds the highest slot {}",
                self, max_slot
            )));
        }
        Ok(self)
    }
}

impl Default for ProgramSlot {
    fn default() -> Self {
        Self(NonZeroU8::MIN)
    }
}

impl fmt::Display for ProgramSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProgramSlot {
    type Err = ChamberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| ChamberError::InvalidCommand(format!("invalid program slot '{}'", s)))
    }
}

impl TryFrom<u8> for ProgramSlot {
    type Error = String;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Self::new(number).ok_or_else(|| "program slot must be at least 1".to_string())
    }
}

impl From<ProgramSlot> for u8 {
    fn from(slot: ProgramSlot) -> Self {
        slot.get()
    }
}

/// Step duration, `HH:MM` on the wire and in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StepDuration {
    hours: u8,
    minutes: u8,
}

impl StepDuration {
    /// `None` unless `hours <= 99` and `minutes < 60`
    pub fn new(hours: u8, minutes: u8) -> Option<Self> {
        (hours <= 99 && minutes < 60).then_some(Self { hours, minutes })
    }

    /// Whole hours
    pub fn hours(&self) -> u8 {
        self.hours
    }

    /// Minutes past the hour
    pub fn minutes(&self) -> u8 {
        self.minutes
    }

    /// Total length in minutes
    pub fn total_minutes(&self) -> u32 {
        u32::from(self.hours) * 60 + u32::from(self.minutes)
    }
}

impl fmt::Display for StepDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hours, self.minutes)
    }
}

impl FromStr for StepDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid duration '{}', expected HH:MM", s);
        let (hours, minutes) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hours = hours.parse::<u8>().map_err(|_| invalid())?;
        let minutes = minutes.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hours, minutes).ok_or_else(invalid)
    }
}

impl TryFrom<String> for StepDuration {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<StepDuration> for String {
    fn from(duration: StepDuration) -> Self {
        duration.to_string()
    }
}

fn ramp_on() -> bool {
    true
}

/// One program step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProgramStep {
    /// Move to `target` over `duration`, linearly when `ramp` is set
    Ramp {
        /// Target temperature
        target: f64,
        /// Linear ramp (`TRAMP ON`) rather than a step change
        #[serde(default = "ramp_on")]
        ramp: bool,
        /// Step length
        duration: StepDuration,
    },
    /// Keep the previous target for `duration`
    Hold {
        /// Step length
        duration: StepDuration,
    },
}

impl ProgramStep {
    /// Step length
    pub fn duration(&self) -> StepDuration {
        match self {
            ProgramStep::Ramp { duration, .. } | ProgramStep::Hold { duration } => *duration,
        }
    }
}

/// Repeat steps `from_step..=to_step` for `cycles` cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatSpec {
    /// First repeated step, 1-based
    pub from_step: usize,
    /// Last repeated step, inclusive
    pub to_step: usize,
    /// Number of cycles
    pub cycles: u32,
}

/// What the chamber does once the program finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndAction {
    /// Hold the last target
    #[default]
    Hold,
    /// Switch the chamber off
    Off,
}

impl EndAction {
    /// Token used in the `END` directive
    pub fn wire_literal(&self) -> &'static str {
        match self {
            EndAction::Hold => "HOLD",
            EndAction::Off => "OFF",
        }
    }
}

/// How an envelope is closed after a rejected directive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortStrategy {
    /// Send `EDIT END`, then erase the slot so no partial program survives
    #[default]
    EndAndErase,
    /// Send `EDIT CANCEL`, keeping whatever the slot held before
    Cancel,
}

/// Temperature program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampProgram {
    /// Steps in order; at most 99
    pub steps: Vec<ProgramStep>,
    /// Optional `COUNT` directive
    #[serde(default)]
    pub repeat: Option<RepeatSpec>,
    /// `END` directive
    #[serde(default)]
    pub end: EndAction,
}

impl Default for RampProgram {
    /// Thermal cycling profile: +60 °C, -40 °C, back to 23 °C, steps 1-4
    /// repeated twice, holding at the end.
    fn default() -> Self {
        let step = StepDuration {
            hours: 1,
            minutes: 30,
        };
        let ramp = |target| ProgramStep::Ramp {
            target,
            ramp: true,
            duration: step,
        };
        let hold = ProgramStep::Hold { duration: step };

        Self {
            steps: vec![ramp(60.0), hold.clone(), ramp(-40.0), hold, ramp(23.0)],
            repeat: Some(RepeatSpec {
                from_step: 1,
                to_step: 4,
                cycles: 2,
            }),
            end: EndAction::Hold,
        }
    }
}

impl RampProgram {
    /// Check the program before anything is sent
    pub fn validate(&self) -> AppResult<()> {
        if self.steps.is_empty() {
            return Err(ChamberError::InvalidProgram(
                "a program needs at least one step".to_string(),
            ));
        }
        if self.steps.len() > MAX_STEPS {
            return Err(ChamberError::InvalidProgram(format!(
                "{} steps exceed the limit of {}",
                self.steps.len(),
                MAX_STEPS
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if let ProgramStep::Ramp { target, .. } = step {
                if !target.is_finite() {
                    return Err(ChamberError::InvalidProgram(format!(
                        "step {} has a non-finite target",
                        i + 1
                    )));
                }
            }
        }
        if let Some(repeat) = &self.repeat {
            let in_range = repeat.from_step >= 1
                && repeat.from_step <= repeat.to_step
                && repeat.to_step <= self.steps.len();
            if !in_range {
                return Err(ChamberError::InvalidProgram(format!(
                    "repeat range {}..{} is outside steps 1..{}",
                    repeat.from_step,
                    repeat.to_step,
                    self.steps.len()
                )));
            }
            if repeat.cycles == 0 {
                return Err(ChamberError::InvalidProgram(
                    "repeat cycles must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Directives between `EDIT START` and `EDIT END`, in wire order
    pub fn body(&self) -> Vec<ProgramDirective> {
        let mut directives: Vec<ProgramDirective> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| ProgramDirective::Step {
                index: i + 1,
                step: step.clone(),
            })
            .collect();
        if let Some(repeat) = self.repeat {
            directives.push(ProgramDirective::Count(repeat));
        }
        directives.push(ProgramDirective::End(self.end));
        directives
    }
}

/// Acknowledgements of the lines that closed an aborted envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvelopeCleanup {
    /// `EDIT END` or `EDIT CANCEL`
    pub closed: Ack,
    /// `PRGM ERASE`, when the strategy erases
    pub erased: Option<Ack>,
}

impl EnvelopeCleanup {
    /// Whether every cleanup line was accepted
    pub fn is_clean(&self) -> bool {
        self.closed.is_ok() && self.erased != Some(Ack::Nok)
    }
}

/// Outcome of writing a program
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProgramWrite {
    /// `EDIT START` was rejected; nothing else was sent
    Refused,
    /// Every directive and `EDIT END` were accepted
    Committed,
    /// A directive was rejected and the envelope was closed
    Aborted {
        /// The rejected line
        directive: String,
        /// Replies to the closing directives
        cleanup: EnvelopeCleanup,
    },
}

impl ProgramWrite {
    /// `true` for `Committed`
    pub fn is_committed(&self) -> bool {
        matches!(self, ProgramWrite::Committed)
    }
}

/// Writes ramp programs into program slots
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramAuthor {
    strategy: AbortStrategy,
}

impl ProgramAuthor {
    /// Author that closes aborted envelopes with `strategy`
    pub fn new(strategy: AbortStrategy) -> Self {
        Self { strategy }
    }

    /// Configured abort strategy
    pub fn strategy(&self) -> AbortStrategy {
        self.strategy
    }

    /// Write `program` into `slot` as one uninterrupted envelope.
    ///
    /// Rejections come back as [`ProgramWrite`] values. A transport fault
    /// mid-envelope is returned as an error; the session is closed by then.
    pub async fn write(
        &self,
        session: &ChamberSession,
        slot: ProgramSlot,
        program: &RampProgram,
    ) -> AppResult<ProgramWrite> {
        program.validate()?;
        let mut exchange = session.exclusive().await;
        self.write_envelope(&mut exchange, slot, program).await
    }

    async fn write_envelope(
        &self,
        exchange: &mut Exchange<'_>,
        slot: ProgramSlot,
        program: &RampProgram,
    ) -> AppResult<ProgramWrite> {
        let start = Command::ProgramWrite {
            slot,
            directive: ProgramDirective::EditStart,
        };
        if exchange.send(&start).await? == Ack::Nok {
            warn!(program = %slot, "Chamber refused to open the program for editing");
            return Ok(ProgramWrite::Refused);
        }

        let mut directives = program.body();
        directives.push(ProgramDirective::EditEnd);

        for directive in directives {
            let command = Command::ProgramWrite { slot, directive };
            if exchange.send(&command).await? == Ack::Nok {
                let rejected = command.to_string();
                let cleanup = self.close_aborted(exchange, slot).await?;
                warn!(
                    program = %slot,
                    directive = %rejected,
                    strategy = ?self.strategy,
                    clean = cleanup.is_clean(),
                    "Program write aborted"
                );
                return Ok(ProgramWrite::Aborted {
                    directive: rejected,
                    cleanup,
                });
            }
        }

        info!(program = %slot, steps = program.steps.len(), "Program written");
        Ok(ProgramWrite::Committed)
    }

    async fn close_aborted(
        &self,
        exchange: &mut Exchange<'_>,
        slot: ProgramSlot,
    ) -> AppResult<EnvelopeCleanup> {
        match self.strategy {
            AbortStrategy::EndAndErase => {
                let closed = exchange
                    .send(&Command::ProgramWrite {
                        slot,
                        directive: ProgramDirective::EditEnd,
                    })
                    .await?;
                let erased = exchange.send(&Command::ProgramErase(slot)).await?;
                Ok(EnvelopeCleanup {
                    closed,
                    erased: Some(erased),
                })
            }
            AbortStrategy::Cancel => {
                let closed = exchange
                    .send(&Command::ProgramWrite {
                        slot,
                        directive: ProgramDirective::EditCancel,
                    })
                    .await?;
                Ok(EnvelopeCleanup {
                    closed,
                    erased: None,
                })
            }
        }
    }
}
