//! orca-deckd - ORCA Deck host daemon.
//!
//! Talks to the keypad over serial, keeps the credential vault locked or
//! unlocked according to badge scans and idle time, and serves the control
//! socket used by `orca-deck-ctl`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use orca_deck_core::config::IdleSource;
use orca_deck_core::{Config, DataDir, IdleProbe};
use orca_deckd::serial::TransportSettings;
use orca_deckd::{
    Collaborators, CommandIdleProbe, ControllerSettings, Daemon, LockController,
    LoggingAutomation, ProcessLauncher, SerialPortOpener, SerialTransport, UnixSocketProvider,
};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Host daemon for the ORCA Deck keypad.
#[derive(Parser)]
#[command(name = "orca-deckd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file [default: ~/.config/orca-deck/config.toml]
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Serial device of the keypad (overrides [device].port)
    #[arg(short, long, value_name = "DEVICE")]
    port: Option<String>,

    /// Path to the control socket [default: $XDG_RUNTIME_DIR/orca-deck/socket]
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Increase log verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only show errors
    #[arg(short, long)]
    quiet: bool,
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // JOURNAL_STREAM is set when stderr is connected to the journal.
    if std::env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(journald_layer)
                .with(filter)
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => println!(
                "{}\tusb {:04x}:{:04x}\t{}",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration from specified path");
            Config::load_from(path).context("Failed to load configuration")
        }
        None => {
            let config = Config::load().context("Failed to load configuration")?;
            match Config::default_path() {
                Some(path) if path.exists() => info!(path = %path.display(), "Loaded configuration"),
                _ => debug!("No config file found, using defaults"),
            }
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    setup_logging(log_level);

    if cli.list_ports {
        return list_ports();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting orca-deckd");

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(port) = cli.port {
        config.device.port = Some(port);
    }
    if config.device.port.is_none() {
        warn!("No serial port configured; set [device].port or pass --port");
    }

    let data_dir = DataDir::new(config.data_dir());
    data_dir
        .ensure()
        .with_context(|| format!("Failed to create {}", data_dir.root().display()))?;
    info!(path = %data_dir.root().display(), "Data directory");

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let opener = SerialPortOpener::from_config(&config);
    let transport = SerialTransport::start(opener, TransportSettings::from_config(&config), events_tx)
        .context("Failed to start serial transport")?;

    let idle = match config.lock.idle_source {
        IdleSource::Os => CommandIdleProbe::from_config(&config.lock)
            .map(|probe| Box::new(probe) as Box<dyn IdleProbe>),
        IdleSource::Serial => None,
    };
    let collaborators = Collaborators {
        launcher: Box::new(ProcessLauncher::from_config(&config.automation)),
        keystrokes: Box::new(LoggingAutomation),
        clipboard: Box::new(LoggingAutomation),
        status: Box::new(LoggingAutomation),
        idle,
    };
    let controller = LockController::new(
        data_dir,
        Box::new(transport.handle()),
        collaborators,
        ControllerSettings::from_config(&config),
    );

    let socket_provider = match cli.socket {
        Some(path) => UnixSocketProvider::new(path),
        None => UnixSocketProvider::default(),
    };

    let daemon = Daemon::new(
        socket_provider,
        controller,
        transport,
        events_rx,
        config.lock.poll_interval(),
    );

    if let Err(e) = daemon.run().await {
        error!(error = %e, "Daemon error");
        return Err(e);
    }

    info!("orca-deckd stopped");
    Ok(())
}
