//! o3diag - ELM327 OBD-II diagnostics from the command line
//!
//! Opens the adapter, runs the init batch, then reads live data or
//! trouble codes.

mod config;
mod dtc_list;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use obd_protocol::{
    command, DtcEntry, LiveData, PidRegistry, ProcessedResponse, ResponseProcessor, Session,
};
use obd_sequencer::{CommandSequencer, Exchange, InitReport, PidPoller, StepOutcome};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::DiagConfig;

/// Mode 03/04 can trigger a protocol search on the first request
const DTC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "o3diag")]
#[command(author, version, about = "ELM327 OBD-II diagnostics")]
struct Cli {
    /// Serial device of the adapter
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Configuration file path
    #[arg(short, long, env = "O3DIAG_CONFIG")]
    config: Option<PathBuf>,

    /// o3script file with DTC descriptions
    #[arg(long)]
    dtc_table: Option<PathBuf>,

    /// Skip the init batch (adapter already configured)
    #[arg(long)]
    no_init: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the adapter and report each step
    Init,

    /// Poll live engine data until interrupted
    Live {
        /// Stop after this many snapshots
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Read stored trouble codes
    Dtc,

    /// Clear stored trouble codes and turn off the MIL
    Clear {
        /// Confirm clearing
        #[arg(long)]
        yes: bool,
    },

    /// Send a raw command and decode the reply
    Send {
        /// AT or OBD command, e.g. `ATDP` or `010C`
        command: String,

        /// Reply deadline in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = DiagConfig::load(cli.config.as_deref())?;
    settings.apply_overrides(cli.port.as_deref(), cli.baud, cli.dtc_table.as_deref());

    init_logging(&settings.log_level, cli.verbose);
    info!("=== o3DIAG v{} ===", env!("CARGO_PKG_VERSION"));

    confirm_destructive(&cli.command)?;

    let table = settings
        .dtc_table
        .as_deref()
        .map(dtc_list::load)
        .unwrap_or_default();
    let processor = ResponseProcessor::new(PidRegistry::standard(), Arc::new(table));

    let session = Session::open(settings.serial_config())
        .await
        .with_context(|| format!("Failed to connect to adapter on {}", settings.port))?;
    let mut sequencer = CommandSequencer::new(session);

    let init_only = matches!(cli.command, Commands::Init);
    if init_only || (settings.auto_init && !cli.no_init) {
        let phases = settings.init_profile.phases(settings.protocol);
        let report = sequencer.run_init_sequence(&phases).await;
        if init_only {
            print_init(&report, cli.json)?;
        }
    }

    let result = match cli.command {
        Commands::Init => Ok(()),
        Commands::Live { count } => live(&mut sequencer, &settings, count, cli.json).await,
        Commands::Dtc => read_dtcs(&mut sequencer, &processor, cli.json).await,
        Commands::Clear { .. } => clear_dtcs(&mut sequencer, &processor).await,
        Commands::Send {
            command,
            timeout_ms,
        } => {
            send_raw(
                &mut sequencer,
                &processor,
                &command,
                Duration::from_millis(timeout_ms),
                cli.json,
            )
            .await
        }
    };

    for event in sequencer.into_session().shutdown().await {
        debug!("{}", event);
    }

    result
}

/// Refuse to clear codes unless the user confirmed with `--yes`
fn confirm_destructive(command: &Commands) -> Result<()> {
    if let Commands::Clear { yes: false } = command {
        bail!("Clearing trouble codes resets readiness monitors; pass --yes to confirm");
    }
    Ok(())
}

fn init_logging(level: &str, verbose: bool) {
    let fallback = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn live(
    sequencer: &mut CommandSequencer,
    settings: &DiagConfig,
    count: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut poller = PidPoller::new(settings.poller_config());
    let stop = poller.stop_handle();
    let (tx, mut rx) = mpsc::channel(16);

    let printer = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut printed = 0usize;
        loop {
            tokio::select! {
                snapshot = rx.recv() => {
                    let Some(snapshot) = snapshot else { break };
                    print_snapshot(&snapshot, json)?;
                    printed += 1;
                    if count.is_some_and(|limit| printed >= limit) {
                        break;
                    }
                }
                _ = &mut ctrl_c => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        stop.stop();
        Ok::<_, anyhow::Error>(())
    };

    let (polled, printed) = tokio::join!(poller.run(sequencer, tx), printer);
    printed?;
    polled.context("Live polling stopped")?;
    Ok(())
}

async fn read_dtcs(
    sequencer: &mut CommandSequencer,
    processor: &ResponseProcessor,
    json: bool,
) -> Result<()> {
    let response = request(sequencer, processor, command::READ_DTCS, DTC_TIMEOUT).await?;
    if response.dtc_report.is_none() {
        bail!("No Mode 03 report in reply: {}", response.text);
    }
    print_dtcs(&response.dtc_entries, json)
}

async fn clear_dtcs(sequencer: &mut CommandSequencer, processor: &ResponseProcessor) -> Result<()> {
    let response = request(sequencer, processor, command::CLEAR_DTCS, DTC_TIMEOUT).await?;
    if response.status.is_advisory() {
        bail!("Clearing trouble codes failed: {}", response.text);
    }
    println!("Trouble codes cleared");
    Ok(())
}

async fn send_raw(
    sequencer: &mut CommandSequencer,
    processor: &ResponseProcessor,
    raw: &str,
    timeout: Duration,
    json: bool,
) -> Result<()> {
    let response = request(sequencer, processor, raw.trim(), timeout).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{}", response.text);
    for reading in &response.readings {
        println!("  {}", reading);
    }
    if response.dtc_report.is_some() {
        print_dtcs(&response.dtc_entries, false)?;
    }
    Ok(())
}

/// Exchange one command and route the reply through the processor
async fn request(
    sequencer: &mut CommandSequencer,
    processor: &ResponseProcessor,
    cmd: &str,
    timeout: Duration,
) -> Result<ProcessedResponse> {
    match sequencer.exchange(cmd, timeout).await {
        Exchange::Reply(reply) => processor
            .process(&reply)
            .with_context(|| format!("Empty reply to {}", cmd)),
        Exchange::Fault(message) => bail!("{} failed: {}", cmd, message),
        Exchange::TimedOut => bail!("No reply to {} within {} ms", cmd, timeout.as_millis()),
        Exchange::Closed(reason) => bail!("Session closed: {}", reason),
    }
}

fn print_init(report: &InitReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for step in &report.steps {
        let detail = match &step.outcome {
            StepOutcome::Answered(text) => text.clone(),
            StepOutcome::Fault(message) => format!("fault: {}", message),
            StepOutcome::TimedOut => "no reply".to_string(),
            StepOutcome::Closed(reason) => format!("closed: {}", reason),
        };
        println!("[{:>8}] {:<6} {}", step.phase, step.command, detail);
    }

    match report.adapter_identity() {
        Some(identity) => println!("Adapter: {}", identity),
        None => warn!("Adapter did not identify itself"),
    }
    if let Some(protocol) = report.detected_protocol() {
        println!("Protocol: {}", protocol);
    }
    Ok(())
}

fn print_snapshot(snapshot: &LiveData, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }

    println!(
        "RPM {:>8}  Speed {:>5}  Coolant {:>5}  Load {:>6}  Voltage {:>6}",
        field(snapshot.rpm.map(|v| format!("{:.0}", v))),
        field(snapshot.speed_kmh.map(|v| format!("{} km/h", v))),
        field(snapshot.coolant_c.map(|v| format!("{} °C", v))),
        field(snapshot.engine_load_pct.map(|v| format!("{:.1} %", v))),
        field(snapshot.battery_volts.map(|v| format!("{:.2} V", v))),
    );
    Ok(())
}

fn field(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

#[derive(Serialize)]
struct DtcOutput<'a> {
    count: usize,
    codes: &'a [DtcEntry],
}

fn print_dtcs(entries: &[DtcEntry], json: bool) -> Result<()> {
    let stored: Vec<_> = entries
        .iter()
        .filter(|entry| entry.code != obd_protocol::NO_CODES_SENTINEL)
        .collect();

    if json {
        let output = DtcOutput {
            count: stored.len(),
            codes: entries,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if stored.is_empty() {
        println!("No diagnostic trouble codes stored");
    } else {
        println!("{} trouble code(s) stored:", stored.len());
    }
    for entry in entries {
        println!("  {}  {}", entry.code, entry.description);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::parse_from(["o3diag", "--port", "COM4", "send", "010C", "--timeout-ms", "500"]);
        assert_eq!(cli.port.as_deref(), Some("COM4"));
        match cli.command {
            Commands::Send {
                command,
                timeout_ms,
            } => {
                assert_eq!(command, "010C");
                assert_eq!(timeout_ms, 500);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_parse_live_count() {
        let cli = Cli::parse_from(["o3diag", "--json", "live", "-n", "3"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Live { count: Some(3) }));
    }

    #[test]
    fn test_clear_requires_confirmation() {
        let cli = Cli::parse_from(["o3diag", "clear"]);
        let err = confirm_destructive(&cli.command).unwrap_err();
        assert!(err.to_string().contains("--yes"));

        let cli = Cli::parse_from(["o3diag", "clear", "--yes"]);
        assert!(confirm_destructive(&cli.command).is_ok());
        let cli = Cli::parse_from(["o3diag", "dtc"]);
        assert!(confirm_destructive(&cli.command).is_ok());
    }

    #[test]
    fn test_flags_applied_over_settings() {
        let cli = Cli::parse_from(["o3diag", "-p", "COM7", "-b", "115200", "dtc"]);
        let mut settings = DiagConfig {
            port: "COM3".to_string(),
            baud_rate: 9600,
            ..Default::default()
        };
        settings.apply_overrides(cli.port.as_deref(), cli.baud, cli.dtc_table.as_deref());
        assert_eq!(settings.port, "COM7");
        assert_eq!(settings.baud_rate, 115200);
        assert_eq!(settings.dtc_table, None);
    }

    mod adapter {
        use super::*;
        use obd_protocol::{DtcTable, MockAdapter, SerialConfig};

        fn sequencer(adapter: &MockAdapter) -> CommandSequencer {
            let config = SerialConfig {
                device: "mock".to_string(),
                settle_delay: Duration::ZERO,
                poll_interval: Duration::from_millis(2),
                ..Default::default()
            };
            CommandSequencer::new(Session::spawn(adapter.clone(), config))
        }

        fn processor() -> ResponseProcessor {
            let table: DtcTable = [("P0103", "Mass air flow circuit high")]
                .into_iter()
                .collect();
            ResponseProcessor::new(PidRegistry::standard(), Arc::new(table))
        }

        #[tokio::test]
        async fn test_read_dtcs_reports_stored_codes() {
            let adapter = MockAdapter::elm327();
            let mut sequencer = sequencer(&adapter);

            read_dtcs(&mut sequencer, &processor(), true).await.unwrap();
            assert_eq!(adapter.written(), vec!["03"]);

            sequencer.into_session().shutdown().await;
        }

        #[tokio::test]
        async fn test_read_dtcs_without_report_fails() {
            let adapter = MockAdapter::elm327();
            adapter.respond("03", "NO DATA\r\r>");
            let mut sequencer = sequencer(&adapter);

            let err = read_dtcs(&mut sequencer, &processor(), false)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("NO DATA"), "{:#}", err);

            sequencer.into_session().shutdown().await;
        }

        #[tokio::test]
        async fn test_clear_dtcs_acknowledged() {
            let adapter = MockAdapter::elm327();
            let mut sequencer = sequencer(&adapter);

            clear_dtcs(&mut sequencer, &processor()).await.unwrap();
            assert_eq!(adapter.written(), vec!["04"]);

            sequencer.into_session().shutdown().await;
        }

        #[tokio::test]
        async fn test_clear_dtcs_rejected_by_vehicle() {
            let adapter = MockAdapter::elm327();
            adapter.respond("04", "NO DATA\r\r>");
            let mut sequencer = sequencer(&adapter);

            let err = clear_dtcs(&mut sequencer, &processor()).await.unwrap_err();
            assert!(err.to_string().contains("Clearing trouble codes failed"));

            sequencer.into_session().shutdown().await;
        }
    }
}
