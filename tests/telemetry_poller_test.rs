//! Telemetry poller against the simulated chamber, logging to temporary files.

use chamber_daq::config::{PollerConfig, StorageConfig};
use chamber_daq::protocol::{Ack, Mode, ModeReport, TemperatureLimits};
use chamber_daq::telemetry::{LiveStatus, PollerExit, TelemetryLog, TelemetryPoller};
use chamber_daq::transport::SimulatedChamber;
use chamber_daq::{ChamberError, ChamberSession, SessionOptions};
use std::path::Path;
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

fn fast_poller() -> PollerConfig {
    PollerConfig {
        tick_interval_ms: 1,
        ..PollerConfig::default()
    }
}

fn poller(session: &ChamberSession, log: TelemetryLog) -> TelemetryPoller {
    TelemetryPoller::new(session.clone(), log, &fast_poller(), &StorageConfig::default())
}

fn rows(path: &Path) -> Vec<csv::StringRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .unwrap();
    reader.records().map(Result::unwrap).collect()
}

#[tokio::test]
async fn test_constant_mode_three_ticks_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("temp_chamber_results.csv");

    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;
    assert_eq!(session.set_mode(Mode::Constant).await.unwrap(), Ack::Ok);
    assert_eq!(
        session
            .set_temperature(23.0, TemperatureLimits::default())
            .await
            .unwrap(),
        Ack::Ok
    );

    let log = TelemetryLog::create(&path).unwrap();
    let exit = poller(&session, log).with_tick_limit(3).spawn().join().await.unwrap();
    assert_eq!(exit, PollerExit::Completed { ticks: 3 });

    let rows = rows(&path);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][1], "23.0");
    assert_eq!(&rows[0][4], "CONSTANT");
    assert_eq!(rows[0].len(), 6);

    // Three ticks, each with TEMP? and MODE? and nothing else
    let polls = chamber
        .commands()
        .into_iter()
        .filter(|c| c == "TEMP?" || c == "MODE?")
        .count();
    assert_eq!(polls, 3 * 2 + 1);
}

#[tokio::test]
async fn test_run_mode_retains_every_third_tick_with_program_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.csv");

    let chamber = SimulatedChamber::new()
        .with_program(1, &["STEP1, TEMP40.0, TRAMP ON, TIME00:15", "COUNT, (1. 1. 3)"])
        .with_mode(ModeReport {
            mode: Mode::Run,
            program: Some(1),
        });
    let session = connect(&chamber).await;

    let log = TelemetryLog::create(&path).unwrap();
    let exit = poller(&session, log).with_tick_limit(7).spawn().join().await.unwrap();
    assert_eq!(exit, PollerExit::Completed { ticks: 7 });

    let rows = rows(&path);
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.len(), 10);
        // Set column carries the step target, not the constant set point
        assert_eq!(&row[1], "40.0");
        assert_eq!(&row[4], "RUN 1");
        assert_eq!(&row[6], "1");
        assert_eq!(&row[9], "3");
    }
    assert!(chamber.commands().iter().any(|c| c == "PRGM MON?"));
}

#[tokio::test]
async fn test_program_monitor_only_polled_in_run() {
    let dir = tempfile::tempdir().unwrap();
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;

    let log = TelemetryLog::create(dir.path().join("idle.csv")).unwrap();
    poller(&session, log).with_tick_limit(4).spawn().join().await.unwrap();

    assert!(!chamber.commands().iter().any(|c| c == "PRGM MON?"));
}

#[tokio::test]
async fn test_unavailable_reading_is_published_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unavailable.csv");
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;
    chamber.reject("TEMP?");

    let log = TelemetryLog::create(&path).unwrap();
    let handle = poller(&session, log).with_tick_limit(6).spawn();
    let status = handle.subscribe();
    handle.join().await.unwrap();

    assert!(rows(&path).is_empty());
    let current = status.borrow().clone();
    match current {
        LiveStatus::Snapshot(snapshot) => {
            assert_eq!(snapshot.reading, None);
            assert!(!snapshot.retained);
            assert_eq!(snapshot.tick, 5);
        }
        other => panic!("expected a snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_mode_query_uses_hint_and_is_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nomode.csv");
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;
    chamber.reject("MODE?");

    let log = TelemetryLog::create(&path).unwrap();
    let handle = poller(&session, log).with_tick_limit(1).spawn();
    let status = handle.subscribe();
    handle.join().await.unwrap();

    assert!(rows(&path).is_empty());
    let current = status.borrow().clone();
    match current {
        LiveStatus::Snapshot(snapshot) => {
            assert_eq!(snapshot.mode, Some(ModeReport::plain(Mode::Standby)));
            assert!(!snapshot.mode_fresh);
        }
        other => panic!("expected a snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stop_is_cooperative() {
    let dir = tempfile::tempdir().unwrap();
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;

    let log = TelemetryLog::create(dir.path().join("stop.csv")).unwrap();
    let handle = poller(&session, log).spawn();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(handle.shutdown().await.unwrap(), PollerExit::Stopped);
    // Stopping the poller leaves the session usable
    assert!(session.is_connected());
    assert!(session.identify().await.is_ok());
}

#[tokio::test]
async fn test_transport_fault_halts_and_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;
    chamber.fail_transport_after(4);

    let log = TelemetryLog::create(dir.path().join("fault.csv")).unwrap();
    let handle = poller(&session, log).spawn();
    let status = handle.subscribe();

    let result = handle.join().await;
    assert!(matches!(result, Err(ChamberError::Transport(_))));
    assert!(matches!(&*status.borrow(), LiveStatus::Halted(_)));
    assert!(!session.is_connected());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_persistence_fault_halts_session() {
    let chamber = SimulatedChamber::new();
    let session = connect(&chamber).await;

    // Every write to /dev/full fails with "no space left on device"
    let log = TelemetryLog::append_to("/dev/full").unwrap();
    let handle = poller(&session, log).with_tick_limit(10).spawn();
    let status = handle.subscribe();

    let result = handle.join().await;
    assert!(matches!(result, Err(ChamberError::Persistence { .. })));
    let current = status.borrow().clone();
    match current {
        LiveStatus::Halted(reason) => assert!(reason.contains("/dev/full")),
        other => panic!("expected a halted status, got {:?}", other),
    }
    assert!(!session.is_connected());

    // Only tick 0 reached the wire
    let temp_queries = chamber.commands().iter().filter(|c| *c == "TEMP?").count();
    assert_eq!(temp_queries, 1);
}
