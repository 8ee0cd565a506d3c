//! `chamberctl`: console for the SU-241 test chamber.
//!
//! ```bash
//! chamberctl run --address GPIB0::10::INSTR
//! chamberctl run --simulate --json
//! chamberctl config
//! ```

use anyhow::{Context, Result};
use chamber_daq::config::{Settings, TransportKind};
use chamber_daq::operator::{Console, OperatorCommand, Outcome, STOP_CONFIRMATION};
use chamber_daq::telemetry::{LiveStatus, PollerHandle, TelemetryLog, TelemetryPoller};
use chamber_daq::transport::{connector_for, Connector};
use chamber_daq::{ChamberSession, SessionOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chamberctl", version, about = "SU-241 test chamber console")]
struct Cli {
    /// Configuration file (defaults to config/chamber.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, start telemetry logging and read commands from stdin
    Run {
        /// Instrument address, overriding the configuration
        #[arg(long)]
        address: Option<String>,
        /// Use the in-process simulated chamber
        #[arg(long)]
        simulate: bool,
        /// Print every telemetry snapshot as a JSON line
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("chamber_daq={level},chamberctl={level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&settings.application.log_level);

    match cli.command {
        Command::Config => {
            println!("{}", settings.to_toml()?);
            Ok(())
        }
        Command::Run {
            address,
            simulate,
            json,
        } => run(settings, address, simulate, json).await,
    }
}

async fn run(mut settings: Settings, address: Option<String>, simulate: bool, json: bool) -> Result<()> {
    if let Some(address) = address {
        settings.instrument.address = address;
    }
    if simulate {
        settings.instrument.transport = TransportKind::Simulated;
    }

    let connector = connector_for(&settings.instrument);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let Some((console, poller)) = connect(&settings, connector.as_ref(), &mut lines).await? else {
        return Ok(());
    };

    let mut status = poller.subscribe();
    let printer = tokio::spawn(print_status(poller.subscribe(), json));
    println!("Connected. Type 'help' for commands.");

    let result = console_loop(&console, &mut lines, &mut status).await;

    let poller_result = poller.shutdown().await;
    printer.abort();
    console.session().disconnect().await;
    println!("Disconnected. The chamber keeps its current mode.");

    result?;
    poller_result.context("Telemetry logging failed; the session was stopped")?;
    Ok(())
}

/// Wait for `connect` (or `quit`), then open the session and start the poller.
///
/// A failed attempt is reported and the operator stays at the prompt.
async fn connect<R>(
    settings: &Settings,
    connector: &dyn Connector,
    lines: &mut Lines<R>,
) -> Result<Option<(Console, PollerHandle)>>
where
    R: AsyncBufRead + Unpin,
{
    println!(
        "Chamber at {} ({:?}). Type 'connect' to start, 'quit' to leave.",
        settings.instrument.address, settings.instrument.transport
    );

    loop {
        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        match line.parse::<OperatorCommand>() {
            Ok(OperatorCommand::Connect) => {}
            Ok(OperatorCommand::Quit) => return Ok(None),
            Ok(_) => {
                println!("Not connected. Type 'connect' first.");
                continue;
            }
            Err(e) => {
                println!("{}", e);
                continue;
            }
        }

        match open_session(settings, connector).await {
            Ok(opened) => return Ok(Some(opened)),
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(error = %message, "Connect attempt failed");
                println!("{}", message);
                println!("Type 'connect' to retry, 'quit' to leave.");
            }
        }
    }
}

async fn open_session(
    settings: &Settings,
    connector: &dyn Connector,
) -> Result<(Console, PollerHandle)> {
    let session = ChamberSession::connect(
        connector,
        &settings.instrument.address,
        SessionOptions::from(&settings.instrument),
    )
    .await
    .with_context(|| format!("Failed to connect to {}", settings.instrument.address))?;

    let path = settings.storage.log_path(chrono::Local::now());
    let log = match TelemetryLog::create(&path) {
        Ok(log) => log,
        Err(e) => {
            session.disconnect().await;
            return Err(e).context("Close the telemetry log file in other programs and try again");
        }
    };
    println!("Logging telemetry to {}", path.display());

    let poller = TelemetryPoller::new(session.clone(), log, &settings.poller, &settings.storage).spawn();
    Ok((Console::new(session, settings), poller))
}

/// Whether `command` needs the operator's confirmation before it runs.
///
/// Commands the current mode does not offer are refused by the console
/// without asking.
fn needs_confirmation(console: &Console, command: &OperatorCommand) -> bool {
    *command == OperatorCommand::StopProgram && console.affordances().permits(command)
}

async fn console_loop<R>(
    console: &Console,
    lines: &mut Lines<R>,
    status: &mut watch::Receiver<LiveStatus>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            changed = status.changed() => {
                if changed.is_err() || matches!(*status.borrow(), LiveStatus::Halted(_)) {
                    return Ok(());
                }
                continue;
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<OperatorCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        if command == OperatorCommand::Status {
            if let LiveStatus::Snapshot(snapshot) = &*status.borrow() {
                println!("{}", snapshot);
            }
        }

        let approved = if needs_confirmation(console, &command) {
            println!("{} [y/N]", STOP_CONFIRMATION);
            let answer = lines.next_line().await?.unwrap_or_default();
            matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
        } else {
            true
        };

        let outcome = console.execute(&command, |_| approved).await?;
        println!("{}", outcome);
        if outcome == Outcome::Quit {
            return Ok(());
        }
    }
}

async fn print_status(mut status: watch::Receiver<LiveStatus>, json: bool) {
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        match current {
            LiveStatus::Snapshot(snapshot) if json => match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "Cannot render snapshot"),
            },
            LiveStatus::Halted(reason) => eprintln!("Telemetry halted: {}", reason),
            _ => {}
        }
    }
}
