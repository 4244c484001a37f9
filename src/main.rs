//! CLI entry point for `reacher`.
//!
//! ```bash
//! # List USB serial ports
//! reacher ports
//!
//! # Acquire from two boxes, stop after 30 minutes of active time
//! reacher run --port /dev/ttyACM0 --port /dev/ttyACM1 \
//!     --filename rat01 --limit-type time --time-limit 30m
//! ```
//!
//! While `run` is active, stdin accepts `pause`, `resume` and `stop`
//! (optionally followed by a device), `status`, and `send <command>`.
//! Ctrl-C stops every session gracefully. The final status of each session is
//! printed as JSON.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reacher_daq::config::{AppConfig, DeviceDefinition, SessionConfig};
use reacher_daq::destination::{default_log_dir, DataDestination};
use reacher_daq::logging::{self, OutputFormat, TracingConfig};
use reacher_daq::session::limits::{LimitConfig, LimitKind};
use reacher_daq::session::{SessionController, SessionHandle, SessionNotice, SessionState};
use reacher_daq::sink::EventSink;
use reacher_daq::transport::{ChannelOpener, DeviceCommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "reacher")]
#[command(about = "Serial event acquisition for behavioral experiment rigs", long_about = None)]
struct Cli {
    /// Configuration file (TOML); `REACHER_*` variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List USB serial ports
    Ports,
    /// Run acquisition sessions
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Serial port to acquire from (repeatable); defaults to enabled config devices
    #[arg(long = "port")]
    ports: Vec<String>,

    /// Baud rate override
    #[arg(long)]
    baud: Option<u32>,

    /// Data root directory (default ~/REACHER/DATA)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Behavior filename (default: start timestamp)
    #[arg(long)]
    filename: Option<String>,

    /// Automatic stop condition
    #[arg(long, value_enum)]
    limit_type: Option<LimitArg>,

    /// Active-time limit, e.g. `30m`
    #[arg(long, value_parser = humantime::parse_duration)]
    time_limit: Option<Duration>,

    /// Number of infusions after which the session stops
    #[arg(long)]
    infusion_limit: Option<u64>,

    /// Delay after the infusion limit before stopping, e.g. `10s`
    #[arg(long, value_parser = humantime::parse_duration)]
    stop_delay: Option<Duration>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LimitArg {
    Time,
    Infusion,
    Both,
}

impl From<LimitArg> for LimitKind {
    fn from(value: LimitArg) -> Self {
        match value {
            LimitArg::Time => LimitKind::Time,
            LimitArg::Infusion => LimitKind::Infusion,
            LimitArg::Both => LimitKind::Both,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let app = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load_env()?,
    };
    app.validate()?;

    let mut tracing_config =
        TracingConfig::from_app_config(&app).map_err(anyhow::Error::msg)?;
    if cli.json_logs {
        tracing_config = tracing_config.with_format(OutputFormat::Json);
    }
    if matches!(cli.command, Commands::Run(_)) && tracing_config.log_dir.is_none() {
        tracing_config = tracing_config.with_log_dir(default_log_dir());
    }
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Run(args) => run(app, args).await,
    }
}

#[cfg(feature = "instrument_serial")]
fn list_ports() -> Result<()> {
    let ports = reacher_daq::transport::serial::available_ports()?;
    if ports.is_empty() {
        println!("No USB serial ports found");
    }
    for port in ports {
        println!(
            "{}\t{:04x}:{:04x}\t{}",
            port.name,
            port.vid,
            port.pid,
            port.product.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports() -> Result<()> {
    bail!("serial support not enabled; rebuild with --features instrument_serial")
}

#[cfg(feature = "instrument_serial")]
fn serial_opener() -> Result<Arc<dyn ChannelOpener>> {
    Ok(Arc::new(reacher_daq::transport::serial::SerialOpener))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_opener() -> Result<Arc<dyn ChannelOpener>> {
    bail!("serial support not enabled; rebuild with --features instrument_serial")
}

#[cfg(feature = "storage_csv")]
fn session_sink(folder: &Path, filename: &str) -> Result<Box<dyn EventSink>> {
    Ok(Box::new(reacher_daq::sink::CsvSink::create(folder, filename)?))
}

#[cfg(not(feature = "storage_csv"))]
fn session_sink(folder: &Path, _filename: &str) -> Result<Box<dyn EventSink>> {
    warn!(folder = %folder.display(), "CSV storage not enabled; events are kept in memory only");
    Ok(Box::new(reacher_daq::sink::NullSink))
}

fn session_config(app: &AppConfig, args: &RunArgs) -> Result<SessionConfig> {
    let mut config = app.session.clone();
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(kind) = args.limit_type {
        config.limits = Some(LimitConfig {
            kind: kind.into(),
            time_limit: args.time_limit,
            infusion_limit: args.infusion_limit,
            stop_delay: args.stop_delay.unwrap_or_default(),
        });
    }
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn devices(app: &AppConfig, args: &RunArgs) -> Vec<DeviceDefinition> {
    if !args.ports.is_empty() {
        return args
            .ports
            .iter()
            .map(|port| DeviceDefinition {
                id: port.clone(),
                port: port.clone(),
                baud_rate: None,
                enabled: true,
            })
            .collect();
    }
    app.enabled_devices().into_iter().cloned().collect()
}

/// Make a device id usable in a file name.
fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

async fn run(app: AppConfig, args: RunArgs) -> Result<()> {
    let base_config = session_config(&app, &args)?;
    let devices = devices(&app, &args);
    if devices.is_empty() {
        bail!("no devices: pass --port or enable devices in the configuration");
    }

    let mut storage = app.storage.clone();
    if let Some(output) = &args.output {
        storage.data_dir = Some(output.clone());
    }
    if let Some(filename) = &args.filename {
        storage.filename = Some(filename.clone());
    }
    let destination = DataDestination::from_config(&storage);

    let controller = Arc::new(SessionController::new(serial_opener()?));
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel::<SessionHandle>();
    let mut handles = Vec::new();

    for device in &devices {
        let destination = if devices.len() > 1 {
            destination.with_filename(format!("{}-{}", destination.stem(), file_safe(&device.id)))
        } else {
            destination.clone()
        };
        let folder = destination.prepare()?;
        let sink = session_sink(&folder, destination.filename())?;

        let mut config = base_config.clone();
        if let Some(baud) = device.baud_rate.filter(|_| args.baud.is_none()) {
            config.baud_rate = baud;
        }

        let ctrl = Arc::clone(&controller);
        let (id, port) = (device.id.clone(), device.port.clone());
        let handle = tokio::task::spawn_blocking(move || ctrl.start_on(&id, &port, config, sink))
            .await?
            .with_context(|| format!("starting session on {}", device.port))?;
        info!(device = %device.id, folder = %folder.display(), "Recording");

        let mut notices = controller.subscribe(handle)?;
        if controller.status(handle)?.state == SessionState::Stopped {
            let _ = stopped_tx.send(handle);
        }
        let tx = stopped_tx.clone();
        tokio::spawn(async move {
            while let Ok(notice) = notices.recv().await {
                if let SessionNotice::Stopped { .. } = notice {
                    let _ = tx.send(handle);
                    break;
                }
            }
        });
        handles.push(handle);
    }
    drop(stopped_tx);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut finished = HashSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping all sessions");
                break;
            }
            stopped = stopped_rx.recv() => {
                match stopped {
                    Some(handle) => {
                        finished.insert(handle);
                        if finished.len() == handles.len() {
                            info!("All sessions stopped");
                            break;
                        }
                    }
                    None => break,
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        if !handle_command(&controller, line.trim()).await? {
                            break;
                        }
                    }
                    None => stdin_open = false,
                }
            }
        }
    }

    let ctrl = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || ctrl.stop_all()).await?;

    let statuses = controller.sessions();
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    let faulted = statuses.iter().filter(|s| s.fault().is_some()).count();
    if faulted > 0 {
        bail!("{faulted} session(s) ended on a fault");
    }
    Ok(())
}

/// Apply one operator command. Returns `false` when the run should end.
async fn handle_command(controller: &Arc<SessionController>, line: &str) -> Result<bool> {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let targets: Vec<SessionHandle> = if rest.is_empty() || command == "send" {
        controller
            .sessions()
            .iter()
            .filter(|s| s.state != SessionState::Stopped)
            .map(|s| s.id)
            .collect()
    } else {
        match controller.handle_for(rest) {
            Some(handle) => vec![handle],
            None => {
                warn!(device = rest, "No active session for device");
                return Ok(true);
            }
        }
    };

    match command {
        "" => {}
        "pause" => {
            for handle in targets {
                if let Err(err) = controller.pause(handle) {
                    warn!(session = %handle, error = %err, "Pause rejected");
                }
            }
        }
        "resume" => {
            for handle in targets {
                if let Err(err) = controller.resume(handle) {
                    warn!(session = %handle, error = %err, "Resume rejected");
                }
            }
        }
        "stop" if rest.is_empty() => return Ok(false),
        "stop" => {
            for handle in targets {
                let ctrl = Arc::clone(controller);
                if let Err(err) = tokio::task::spawn_blocking(move || ctrl.stop(handle)).await? {
                    warn!(session = %handle, error = %err, "Stop rejected");
                }
            }
        }
        "status" => println!("{}", serde_json::to_string_pretty(&controller.sessions())?),
        "send" if !rest.is_empty() => {
            let command = DeviceCommand::Raw(rest.to_string());
            for handle in targets {
                if let Err(err) = controller.send_command(handle, &command) {
                    warn!(session = %handle, error = %err, "Command not sent");
                }
            }
        }
        other => warn!(
            command = other,
            "Unknown command (pause, resume, stop [device], status, send <command>)"
        ),
    }
    Ok(true)
}
