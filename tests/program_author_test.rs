//! Writing ramp programs through the edit envelope.

use chamber_daq::program::{
    AbortStrategy, EndAction, ProgramAuthor, ProgramSlot, ProgramStep, ProgramWrite, RampProgram,
    StepDuration,
};
use chamber_daq::protocol::{Ack, Mode, ModeReport};
use chamber_daq::transport::SimulatedChamber;
use chamber_daq::{ChamberError, ChamberSession, SessionOptions};
use std::time::Duration;

async fn connect(chamber: &SimulatedChamber) -> ChamberSession {
    let options = SessionOptions {
        connect_timeout: Duration::from_secs(1),
        settle_delay: Duration::ZERO,
    };
    ChamberSession::connect(chamber, "SIM::1", options)
        .await
        .unwrap()
}

fn short_program() -> RampProgram {
    RampProgram {
        steps: vec![
            ProgramStep::Ramp {
                target: 40.0,
                ramp: true,
                duration: StepDuration::new(0, 15).unwrap(),
            },
            ProgramStep::Hold {
                duration: StepDuration::new(0, 5).unwrap(),
            },
        ],
        repeat: None,
        end: EndAction::Off,
    }
}

fn slot(n: u8) -> ProgramSlot {
    ProgramSlot::new(n).unwrap()
}

#[tokio::test]
async fn test_commit_sends_closed_envelope() {
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;
    chamber.clear_log();

    let result = ProgramAuthor::default()
        .write(&session, slot(2), &short_program())
        .await
        .unwrap();

    assert_eq!(result, ProgramWrite::Committed);
    assert_eq!(
        chamber.commands(),
        vec![
            "PRGM DATA WRITE, PGM: 2, EDIT START",
            "PRGM DATA WRITE, PGM: 2, STEP1, TEMP40.0, TRAMP ON, TIME00:15",
            "PRGM DATA WRITE, PGM: 2, STEP2, TIME00:05",
            "PRGM DATA WRITE, PGM: 2, END, OFF",
            "PRGM DATA WRITE, PGM: 2, EDIT END",
        ]
    );
    assert!(!chamber.edit_open());
    assert_eq!(chamber.program(2).unwrap().directives.len(), 3);
}

#[tokio::test]
async fn test_default_profile_is_written_in_order() {
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;

    let result = ProgramAuthor::default()
        .write(&session, ProgramSlot::default(), &RampProgram::default())
        .await
        .unwrap();

    assert!(result.is_committed());
    let stored = chamber.program(1).unwrap();
    assert_eq!(stored.directives.first().unwrap(), "STEP1, TEMP60.0, TRAMP ON, TIME01:30");
    assert_eq!(stored.directives[5], "COUNT, (1. 4. 2)");
    assert_eq!(stored.directives.last().unwrap(), "END, HOLD");
}

#[tokio::test]
async fn test_refused_start_leaves_slot_untouched() {
    let chamber = SimulatedChamber::new()
        .with_program(1, &["STEP1, TEMP30.0, TRAMP ON, TIME00:10", "END, HOLD"])
        .with_mode(ModeReport {
            mode: Mode::Run,
            program: Some(1),
        });
    let session = connect(&chamber).await;
    chamber.clear_log();

    let result = ProgramAuthor::default()
        .write(&session, slot(1), &short_program())
        .await
        .unwrap();

    assert_eq!(result, ProgramWrite::Refused);
    assert_eq!(chamber.commands().len(), 1);
    assert_eq!(chamber.program(1).unwrap().directives.len(), 2);
}

#[tokio::test]
async fn test_body_failure_closes_and_erases() {
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;
    chamber.reject("STEP2");

    let result = ProgramAuthor::new(AbortStrategy::EndAndErase)
        .write(&session, slot(3), &short_program())
        .await
        .unwrap();

    match result {
        ProgramWrite::Aborted { directive, cleanup } => {
            assert_eq!(directive, "PRGM DATA WRITE, PGM: 3, STEP2, TIME00:05");
            assert_eq!(cleanup.closed, Ack::Ok);
            assert_eq!(cleanup.erased, Some(Ack::Ok));
        }
        other => panic!("expected an aborted write, got {:?}", other),
    }
    assert!(!chamber.edit_open());
    assert!(chamber.program(3).is_none());

    let commands = chamber.commands();
    assert_eq!(
        &commands[commands.len() - 2..],
        &[
            "PRGM DATA WRITE, PGM: 3, EDIT END".to_string(),
            "PRGM ERASE, PGM: 3".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_cancel_keeps_previous_program() {
    let chamber = SimulatedChamber::new().with_program(4, &["STEP1, TIME00:30", "END, HOLD"]);
    let session = connect(&chamber).await;
    chamber.reject("END, OFF");

    let result = ProgramAuthor::new(AbortStrategy::Cancel)
        .write(&session, slot(4), &short_program())
        .await
        .unwrap();

    match result {
        ProgramWrite::Aborted { cleanup, .. } => {
            assert!(cleanup.is_clean());
            assert_eq!(cleanup.erased, None);
        }
        other => panic!("expected an aborted write, got {:?}", other),
    }
    assert!(!chamber.edit_open());
    assert_eq!(
        chamber.program(4).unwrap().directives,
        vec!["STEP1, TIME00:30".to_string(), "END, HOLD".to_string()]
    );
    assert_eq!(
        chamber.commands().last().map(String::as_str),
        Some("PRGM DATA WRITE, PGM: 4, EDIT CANCEL")
    );
}

#[tokio::test]
async fn test_failed_commit_is_cleaned_up() {
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;
    chamber.script_reply_times("EDIT END", "NA:EDIT ERR-5", 1);

    let result = ProgramAuthor::default()
        .write(&session, slot(5), &short_program())
        .await
        .unwrap();

    assert!(matches!(result, ProgramWrite::Aborted { .. }));
    assert!(!chamber.edit_open());
    assert!(chamber.program(5).is_none());
}

#[tokio::test]
async fn test_invalid_program_never_reaches_the_wire() {
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;
    chamber.clear_log();

    let empty = RampProgram {
        steps: vec![],
        repeat: None,
        end: EndAction::Hold,
    };
    let result = ProgramAuthor::default().write(&session, slot(1), &empty).await;

    assert!(matches!(result, Err(ChamberError::InvalidProgram(_))));
    assert!(chamber.commands().is_empty());
}

#[tokio::test]
async fn test_polling_cannot_land_inside_envelope() {
    let chamber = SimulatedChamber::new().with_reply_latency(Duration::from_millis(1));
    let session = connect(&chamber).await;
    chamber.clear_log();

    let poller = {
        let session = session.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                session.read_temperature().await.unwrap();
            }
        })
    };
    let result = ProgramAuthor::default()
        .write(&session, slot(1), &RampProgram::default())
        .await
        .unwrap();
    poller.await.unwrap();

    assert!(result.is_committed());
    let commands = chamber.commands();
    let start = commands
        .iter()
        .position(|c| c.ends_with("EDIT START"))
        .unwrap();
    let end = commands.iter().position(|c| c.ends_with("EDIT END")).unwrap();
    assert!(commands[start..=end]
        .iter()
        .all(|c| c.starts_with("PRGM DATA WRITE")));
}
