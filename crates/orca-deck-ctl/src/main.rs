//! orca-deck-ctl - Control utility for the ORCA Deck host daemon.
//!
//! # Usage
//!
//! ```bash
//! # First run: answer the recovery questions, then scan a badge
//! orca-deck-ctl setup
//!
//! # Show lock state, keypad connection and recent activity
//! orca-deck-ctl status
//!
//! # Bind key A to a URL and give it a label
//! orca-deck-ctl app A https://mail.example.com
//! orca-deck-ctl label app A Mail
//!
//! # Store a login on key 1 (password is prompted)
//! orca-deck-ctl credential 1 --username alice
//!
//! # Push an icon (any PNG/JPEG/BMP/GIF is resized to 32x32)
//! orca-deck-ctl icon app A mail.png
//!
//! # Unlock without a badge
//! orca-deck-ctl recover
//!
//! # Switch to another serial device and lock after 5 idle minutes
//! orca-deck-ctl config --port /dev/ttyACM0 --auto-lock 5
//! ```

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand, ValueEnum};
use image::imageops::FilterType;
use orca_deck_core::control::{SlotInfo, StatusReport};
use orca_deck_core::icon::ICON_SIZE;
use orca_deck_core::{IconPayload, KeySlot, Request, Response, SlotKind};
use secrecy::{ExposeSecret, SecretString};

/// Control utility for the ORCA Deck host daemon.
#[derive(Parser)]
#[command(name = "orca-deck-ctl")]
#[command(about = "Control the ORCA Deck host daemon")]
#[command(version)]
struct Cli {
    /// Path to the daemon socket [default: $XDG_RUNTIME_DIR/orca-deck/socket]
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show lock state, keypad connection and recent activity
    Status,

    /// Lock now
    Lock,

    /// First-run setup: answer the recovery questions
    Setup,

    /// Unlock with the recovery questions
    Recover,

    /// Rename a slot (an empty name restores the default)
    Label {
        /// app or pass
        kind: SlotKind,
        key: KeySlot,
        #[arg(default_value = "")]
        name: String,
    },

    /// Bind a path, URL or search text to an app slot
    App {
        key: KeySlot,
        /// Path, URL or text typed into the OS search (omit with --clear)
        target: Option<String>,
        #[arg(long, conflicts_with = "target")]
        clear: bool,
    },

    /// Store or clear the login on a password slot
    #[command(alias = "cred")]
    Credential {
        key: KeySlot,
        #[arg(long, short = 'u', default_value = "")]
        username: String,
        #[arg(long, conflicts_with = "username")]
        clear: bool,
    },

    /// List all slots (no secrets)
    #[command(alias = "ls")]
    Slots,

    /// Manage authorized badges
    Uid {
        #[command(subcommand)]
        command: UidCommands,
    },

    /// Upload a 32x32 icon to the keypad
    Icon {
        /// app or pass
        kind: SlotKind,
        key: KeySlot,
        /// Image file, or raw pixels with --format
        file: PathBuf,
        /// Input format [default: from the file extension]
        #[arg(long, value_enum)]
        format: Option<IconFormat>,
    },

    /// Change the serial port or auto-lock timeout until the daemon restarts
    Config {
        /// Serial device to reconnect to
        #[arg(long, value_name = "DEVICE")]
        port: Option<String>,
        /// Idle minutes before locking (0 disables auto-lock)
        #[arg(long, value_name = "MINUTES")]
        auto_lock: Option<u64>,
    },

    /// Check if the daemon is running
    Ping,
}

#[derive(Subcommand)]
enum UidCommands {
    /// Authorize a badge
    Add { uid: String },
    /// Revoke a badge
    #[command(alias = "rm")]
    Remove { uid: String },
    /// List authorized badges
    #[command(alias = "ls")]
    List,
}

/// Get the socket path.
fn get_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(runtime_dir) => runtime_dir.join("orca-deck").join("socket"),
        None => {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/orca-deck-{}", uid)).join("socket")
        }
    }
}

struct Client {
    socket_path: PathBuf,
}

impl Client {
    /// Send a request to the daemon and receive a response.
    fn send(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!("Failed to connect to daemon at {}", self.socket_path.display())
        })?;

        let request_json = request
            .to_json_line()
            .context("Failed to serialize request")?;
        stream
            .write_all(request_json.as_bytes())
            .context("Failed to send request")?;
        stream.flush().context("Failed to flush request")?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .context("Failed to read response")?;

        Response::parse(response_line.trim()).context("Failed to parse response")
    }
}

/// Print an error or unexpected response.
fn failure(response: Response) -> ExitCode {
    match response {
        Response::Error { code, message } => eprintln!("Error ({}): {}", code, message),
        _ => eprintln!("Unexpected response from daemon"),
    }
    ExitCode::FAILURE
}

fn expect_done(response: Response, message: &str) -> ExitCode {
    match response {
        Response::Done => {
            println!("{}", message);
            ExitCode::SUCCESS
        }
        other => failure(other),
    }
}

/// Format a duration in seconds as a short human-readable string.
fn format_duration(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

/// Format a Unix timestamp relative to `now`.
fn format_age(at: u64, now: u64) -> String {
    format!("{} ago", format_duration(now.saturating_sub(at)))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn render_status(report: &StatusReport, now: u64) -> String {
    let mut out = String::new();
    out.push_str(&format!("State:       {}\n", report.phase));
    out.push_str(&format!(
        "Keypad:      {}\n",
        if report.connected {
            "connected"
        } else {
            "disconnected"
        }
    ));
    out.push_str(&format!(
        "Last unlock: {}\n",
        report
            .last_unlock
            .map(|at| format_age(at, now))
            .unwrap_or_else(|| "never".to_string())
    ));
    out.push_str(&format!("Badges:      {}\n", report.authorized_uids));
    out.push_str(&format!(
        "Auto-lock:   {}\n",
        report
            .auto_lock_secs
            .map(format_duration)
            .unwrap_or_else(|| "off".to_string())
    ));

    if !report.recent.is_empty() {
        out.push_str("\nRecent activity:\n");
        for entry in report.recent.iter().rev().take(10) {
            out.push_str(&format!(
                "  {:>10}  {}\n",
                format_age(entry.at, now),
                entry.message
            ));
        }
    }
    out
}

fn render_slots(slots: &[SlotInfo]) -> String {
    let mut out = format!(
        "{:<4} {:<16} {:<32} {:<16} {}\n",
        "KEY", "APP", "TARGET", "PASS", "LOGIN"
    );
    out.push_str(&"-".repeat(76));
    out.push('\n');

    for slot in slots.iter().filter(|s| s.editable) {
        let target = match slot.app_target.as_deref() {
            Some(t) if t.chars().count() > 30 => {
                format!("{}...", t.chars().take(27).collect::<String>())
            }
            Some(t) => t.to_string(),
            None => "-".to_string(),
        };
        let login = match slot.has_credential {
            Some(true) => "stored",
            Some(false) => "-",
            None => "locked",
        };
        out.push_str(&format!(
            "{:<4} {:<16} {:<32} {:<16} {}\n",
            slot.key, slot.app_label, target, slot.pass_label, login
        ));
    }
    out
}

/// How an icon file is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IconFormat {
    /// PNG, JPEG, BMP or GIF, resized to 32x32
    Image,
    /// Raw RGB565 big-endian (2048 bytes)
    Rgb565,
    /// Raw RGB888 (3072 bytes)
    Rgb888,
}

impl IconFormat {
    fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("rgb565") | Some("raw") => IconFormat::Rgb565,
            Some("rgb") | Some("rgb888") => IconFormat::Rgb888,
            _ => IconFormat::Image,
        }
    }
}

/// Read an icon file and convert it to the keypad's RGB565 layout.
fn load_icon(path: &Path, format: Option<IconFormat>) -> Result<IconPayload> {
    let format = format.unwrap_or_else(|| IconFormat::from_path(path));
    let icon = match format {
        IconFormat::Image => {
            let img = image::open(path)
                .with_context(|| format!("Failed to decode image {}", path.display()))?;
            let side = ICON_SIZE as u32;
            let pixels = img
                .resize_exact(side, side, FilterType::Lanczos3)
                .to_rgb8()
                .into_raw();
            IconPayload::from_rgb888(&pixels)
        }
        raw => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if raw == IconFormat::Rgb888 {
                IconPayload::from_rgb888(&bytes)
            } else {
                IconPayload::new(bytes)
            }
        }
    };
    icon.with_context(|| format!("Invalid icon file {}", path.display()))
}

fn fetch_questions(client: &Client) -> Result<Vec<String>> {
    match client.send(&Request::Questions)? {
        Response::Questions { questions } => Ok(questions),
        Response::Error { code, message } => {
            anyhow::bail!("Error fetching questions ({}): {}", code, message)
        }
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Prompt for each answer without echo.
fn prompt_answers(questions: &[String]) -> Result<Vec<SecretString>> {
    questions
        .iter()
        .map(|question| {
            rpassword::prompt_password(format!("{} ", question))
                .map(SecretString::from)
                .context("Failed to read answer")
        })
        .collect()
}

fn cmd_status(client: &Client) -> Result<ExitCode> {
    match client.send(&Request::Status)? {
        Response::Status(report) => {
            print!("{}", render_status(&report, unix_now()));
            Ok(ExitCode::SUCCESS)
        }
        other => Ok(failure(other)),
    }
}

fn cmd_setup(client: &Client) -> Result<ExitCode> {
    let questions = fetch_questions(client)?;
    println!("Answer the recovery questions. Answers are not case sensitive.");
    let answers = prompt_answers(&questions)?;

    let response = client.send(&Request::SubmitSetup { answers })?;
    Ok(expect_done(
        response,
        "Setup saved. Scan a badge on the keypad to finish.",
    ))
}

fn cmd_recover(client: &Client) -> Result<ExitCode> {
    let questions = fetch_questions(client)?;
    let answers = prompt_answers(&questions)?;

    let response = client.send(&Request::RecoveryUnlock { answers })?;
    Ok(expect_done(response, "Unlocked."))
}

fn cmd_credential(client: &Client, key: KeySlot, username: String, clear: bool) -> Result<ExitCode> {
    if clear {
        let response = client.send(&Request::ClearCredential { key })?;
        return Ok(expect_done(response, "Credential cleared."));
    }

    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let confirm = rpassword::prompt_password("Confirm password: ")
        .context("Failed to read password")?;
    let password = SecretString::from(password);
    if password.expose_secret() != confirm {
        eprintln!("Error: passwords do not match");
        return Ok(ExitCode::FAILURE);
    }

    let response = client.send(&Request::SetCredential {
        key,
        username,
        password,
    })?;
    Ok(expect_done(response, "Credential stored."))
}

fn cmd_uid(client: &Client, command: UidCommands) -> Result<ExitCode> {
    match command {
        UidCommands::Add { uid } => {
            let response = client.send(&Request::AddUid { uid })?;
            Ok(expect_done(response, "Badge authorized."))
        }
        UidCommands::Remove { uid } => {
            let response = client.send(&Request::RemoveUid { uid })?;
            Ok(expect_done(response, "Badge revoked."))
        }
        UidCommands::List => match client.send(&Request::ListUids)? {
            Response::Uids { uids } => {
                if uids.is_empty() {
                    println!("No authorized badges.");
                }
                for uid in uids {
                    println!("{}", uid);
                }
                Ok(ExitCode::SUCCESS)
            }
            other => Ok(failure(other)),
        },
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let client = Client {
        socket_path: cli.socket.unwrap_or_else(get_socket_path),
    };

    match cli.command {
        Commands::Status => cmd_status(&client),
        Commands::Lock => Ok(expect_done(client.send(&Request::Lock)?, "Locked.")),
        Commands::Setup => cmd_setup(&client),
        Commands::Recover => cmd_recover(&client),
        Commands::Label { kind, key, name } => {
            let response = client.send(&Request::SetLabel { kind, key, name })?;
            Ok(expect_done(response, "Label updated."))
        }
        Commands::App { key, target, clear } => {
            let request = match (target, clear) {
                (_, true) => Request::ClearApp { key },
                (Some(target), false) => Request::SetApp { key, target },
                (None, false) => {
                    eprintln!("Error: Must specify a target or --clear");
                    return Ok(ExitCode::FAILURE);
                }
            };
            Ok(expect_done(client.send(&request)?, "App slot updated."))
        }
        Commands::Credential {
            key,
            username,
            clear,
        } => cmd_credential(&client, key, username, clear),
        Commands::Slots => match client.send(&Request::ListSlots)? {
            Response::Slots { slots } => {
                print!("{}", render_slots(&slots));
                Ok(ExitCode::SUCCESS)
            }
            other => Ok(failure(other)),
        },
        Commands::Uid { command } => cmd_uid(&client, command),
        Commands::Icon {
            kind,
            key,
            file,
            format,
        } => {
            let icon = load_icon(&file, format)?;
            let payload = BASE64.encode(icon.as_bytes());
            println!("Uploading {} bytes...", icon.len());
            let response = client.send(&Request::UploadIcon { kind, key, payload })?;
            Ok(expect_done(response, "Icon uploaded."))
        }
        Commands::Config { port, auto_lock } => {
            if port.is_none() && auto_lock.is_none() {
                eprintln!("Nothing to change: pass --port and/or --auto-lock.");
                return Ok(ExitCode::FAILURE);
            }
            let response = client.send(&Request::Configure {
                port,
                auto_lock_minutes: auto_lock,
            })?;
            Ok(expect_done(response, "Settings updated."))
        }
        Commands::Ping => match client.send(&Request::Ping)? {
            Response::Pong => {
                println!("Daemon is running.");
                Ok(ExitCode::SUCCESS)
            }
            other => Ok(failure(other)),
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orca_deck_core::control::ActivityEntry;
    use orca_deck_core::icon::{ICON_BYTES, RGB888_BYTES};
    use orca_deck_core::{LockPhase, LockState};

    fn key(c: char) -> KeySlot {
        KeySlot::new(c).unwrap()
    }

    #[test]
    fn format_duration_ranges() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(900), "15m 0s");
        assert_eq!(format_duration(5400), "1h 30m");
    }

    #[test]
    fn format_age_clamps_future_timestamps() {
        assert_eq!(format_age(100, 130), "30s ago");
        assert_eq!(format_age(200, 100), "0s ago");
    }

    #[test]
    fn status_rendering() {
        let report = StatusReport {
            connected: true,
            state: LockState::Unlocked,
            phase: LockPhase::Unlocked,
            last_unlock: Some(1_000),
            authorized_uids: 2,
            auto_lock_secs: None,
            recent: vec![
                ActivityEntry {
                    at: 990,
                    message: "Keypad connected".to_string(),
                },
                ActivityEntry {
                    at: 1_000,
                    message: "Unlocked via badge".to_string(),
                },
            ],
        };

        let text = render_status(&report, 1_065);
        assert!(text.contains("State:       unlocked"));
        assert!(text.contains("Keypad:      connected"));
        assert!(text.contains("Last unlock: 1m 5s ago"));
        assert!(text.contains("Auto-lock:   off"));
        let newest = text.find("Unlocked via badge").unwrap();
        let oldest = text.find("Keypad connected").unwrap();
        assert!(newest < oldest);
    }

    #[test]
    fn slot_rendering_hides_back_key_and_truncates() {
        let slots = vec![
            SlotInfo {
                key: key('A'),
                editable: true,
                app_label: "Mail".to_string(),
                pass_label: "Item A".to_string(),
                app_target: Some(format!("https://{}.example.com", "x".repeat(40))),
                has_credential: Some(true),
            },
            SlotInfo {
                key: KeySlot::BACK,
                editable: false,
                app_label: "Back".to_string(),
                pass_label: "Back".to_string(),
                app_target: None,
                has_credential: None,
            },
            SlotInfo {
                key: key('1'),
                editable: true,
                app_label: "App 1".to_string(),
                pass_label: "Item 1".to_string(),
                app_target: None,
                has_credential: None,
            },
        ];

        let text = render_slots(&slots);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("A "));
        assert!(lines[2].contains("..."));
        assert!(lines[2].ends_with("stored"));
        assert!(lines[3].ends_with("locked"));
        assert!(!text.contains("Back"));
    }

    #[test]
    fn load_icon_variants() {
        let dir = tempfile::tempdir().unwrap();

        let raw = dir.path().join("icon.rgb565");
        std::fs::write(&raw, vec![0u8; ICON_BYTES]).unwrap();
        assert_eq!(load_icon(&raw, None).unwrap().len(), ICON_BYTES);
        assert!(load_icon(&raw, Some(IconFormat::Rgb888)).is_err());

        let rgb = dir.path().join("icon.bin");
        std::fs::write(&rgb, vec![0xFFu8; RGB888_BYTES]).unwrap();
        let icon = load_icon(&rgb, Some(IconFormat::Rgb888)).unwrap();
        assert_eq!(icon.len(), ICON_BYTES);
        assert_eq!(&icon.as_bytes()[..2], &[0xFF, 0xFF]);

        assert!(load_icon(&dir.path().join("missing"), Some(IconFormat::Rgb565)).is_err());
    }

    #[test]
    fn load_icon_resizes_images() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("red.png");
        image::RgbImage::from_pixel(64, 48, image::Rgb([255, 0, 0]))
            .save(&png)
            .unwrap();

        let icon = load_icon(&png, None).unwrap();
        assert_eq!(icon.len(), ICON_BYTES);
        assert!(icon.as_bytes().chunks(2).all(|px| px == [0xF8, 0x00]));
    }

    #[test]
    fn load_icon_rejects_non_images() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("notes.png");
        std::fs::write(&bogus, b"not an image").unwrap();
        assert!(load_icon(&bogus, None).is_err());
    }

    #[test]
    fn icon_format_from_extension() {
        assert_eq!(IconFormat::from_path(Path::new("a.RGB565")), IconFormat::Rgb565);
        assert_eq!(IconFormat::from_path(Path::new("a.raw")), IconFormat::Rgb565);
        assert_eq!(IconFormat::from_path(Path::new("a.rgb")), IconFormat::Rgb888);
        assert_eq!(IconFormat::from_path(Path::new("a.jpg")), IconFormat::Image);
        assert_eq!(IconFormat::from_path(Path::new("icon")), IconFormat::Image);
    }

    #[test]
    fn cli_parses_config_flags() {
        let cli = Cli::try_parse_from([
            "orca-deck-ctl",
            "config",
            "--port",
            "/dev/ttyACM0",
            "--auto-lock",
            "0",
        ])
        .unwrap();
        match cli.command {
            Commands::Config { port, auto_lock } => {
                assert_eq!(port.as_deref(), Some("/dev/ttyACM0"));
                assert_eq!(auto_lock, Some(0));
            }
            _ => panic!("expected config"),
        }
        assert!(Cli::try_parse_from(["orca-deck-ctl", "config", "--auto-lock", "soon"]).is_err());
    }

    #[test]
    fn cli_parses_slot_arguments() {
        let cli = Cli::try_parse_from(["orca-deck-ctl", "label", "pass", "5", "Bank"]).unwrap();
        match cli.command {
            Commands::Label { kind, key: k, name } => {
                assert_eq!(kind, SlotKind::Pass);
                assert_eq!(k, key('5'));
                assert_eq!(name, "Bank");
            }
            _ => panic!("expected label"),
        }

        assert!(Cli::try_parse_from(["orca-deck-ctl", "app", "Z", "x"]).is_err());
        assert!(Cli::try_parse_from(["orca-deck-ctl", "label", "both", "A"]).is_err());
    }

    #[test]
    fn socket_path_uses_runtime_dir() {
        let path = get_socket_path();
        assert!(path.ends_with("socket"));
    }
}
