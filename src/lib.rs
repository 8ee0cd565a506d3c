//! Core library for the SU-241 environmental test chamber.
//!
//! The library drives the chamber over its ASCII line protocol, writes ramp
//! programs into program memory and logs telemetry to a durable CSV file.
//! It is used by the `chamberctl` console binary and the integration tests.
//!
//! - [`session`]: the single owner of the instrument transport
//! - [`program`]: ramp programs and the edit-envelope author
//! - [`telemetry`]: the background poller and its CSV log
//! - [`operator`]: the text command surface of the console
//! - [`transport`]: serial, VISA and simulated back-ends

pub mod config;
pub mod error;
pub mod operator;
pub mod program;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use error::{AppResult, ChamberError};
pub use session::{ChamberSession, SessionOptions};
