use anyhow::{bail, Result};
use clap::Parser;
use eyecap::{
    status_summary, EventFilter, EventReceiver, EyecapConfig, EyecapEvent, KeyCommand,
    KeyboardInputHandler, Recorder, RecordingMode, StatusEvent, UserInfo,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "eyecap")]
#[command(about = "Record eye and face tracking images from a networked camera device")]
#[command(version)]
#[command(long_about = "Connects to a camera device streaming JPEG frames over WebSocket, \
saves frames into a per-user session folder (optionally guided through a multi-stage \
eye capture plan) and packages the session into a zip archive when recording ends.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "eyecap.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Device address, overrides the configuration file
    #[arg(short, long, help = "Device address: IP, host:port or ws:// URL")]
    address: Option<String>,

    /// Name the session folder and archive are created under
    #[arg(short, long, help = "Username for the recording session")]
    username: Option<String>,

    #[arg(short, long, default_value = "", help = "Email recorded in the archive manifest")]
    email: String,

    /// Run the multi-stage eye capture plan instead of free recording
    #[arg(long, help = "Guide the user through the stage plan")]
    stages: bool,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to a daily file in this directory
    #[arg(long, value_name = "DIR", help = "Directory for rotated log files")]
    log_dir: Option<String>,

    /// Disable keyboard control
    #[arg(long, help = "Do not read keys from the terminal")]
    no_keyboard: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let _log_guard = init_logging(&args)?;

    info!("Starting eyecap v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = match EyecapConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    if let Some(address) = &args.address {
        config.device.address = address.clone();
    }

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let Some(username) = args.username.clone() else {
        bail!("--username is required to start a recording");
    };
    let mode = if args.stages {
        RecordingMode::MultiStage
    } else {
        RecordingMode::Single
    };

    let address = config.device.address.clone();
    let recorder = Recorder::new(config).map_err(|e| {
        error!("Failed to create recorder: {}", e);
        e
    })?;

    let events = EventReceiver::new(
        recorder.event_bus().subscribe(),
        EventFilter::EventTypes(vec![
            "status",
            "stage_guidance",
            "stage_countdown",
            "stage_started",
            "stage_completed",
            "plan_completed",
            "reconnect_scheduled",
            "recording_stopped",
            "packaging_completed",
            "packaging_failed",
        ]),
        "cli",
    );
    let (finished_tx, mut finished) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(events, finished_tx));

    let endpoints = recorder.connect(&address)?;
    info!("Connecting to {} ({} candidates)", address, endpoints.len());

    let folder = recorder
        .start_recording(UserInfo::new(username, args.email.clone()), mode)
        .await?;
    info!("Recording into {}", folder.display());

    let keyboard = KeyboardInputHandler::new();
    let mut keys = if args.no_keyboard {
        None
    } else {
        match keyboard.start() {
            Ok(keys) => Some(keys),
            Err(e) => {
                warn!("Keyboard control unavailable: {}", e);
                None
            }
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, finishing recording");
                break;
            }
            _ = finished.recv() => {
                info!("Recording finished");
                break;
            }
            key = next_key(&mut keys) => match key {
                Some(KeyCommand::CaptureNow) => {
                    if !recorder.capture_now().await? {
                        warn!("Nothing captured: no frame received yet");
                    }
                }
                Some(KeyCommand::Status) => {
                    let status = recorder.status().await?;
                    let session = status
                        .session
                        .map(|s| format!("{} images, {}", s.image_count, s.elapsed_display))
                        .unwrap_or_else(|| "not recording".to_string());
                    let device = status_summary(status.connection.battery, status.connection.brightness)
                        .unwrap_or_else(|| "no device status".to_string());
                    print!("[{}] {} | {}\r\n", status.connection.state, session, device);
                }
                Some(KeyCommand::StopRecording) | Some(KeyCommand::Quit) | None => break,
            },
        }
    }

    keyboard.stop().await;

    let exit_code = match recorder.disconnect().await {
        Ok(Some(archive)) => {
            println!("Archive written to {}", archive.display());
            0
        }
        Ok(None) => 0,
        Err(e) => {
            error!("Recording could not be packaged: {}", e);
            1
        }
    };

    recorder.shutdown().await;
    printer.abort();

    info!("eyecap exited with code: {}", exit_code);
    std::process::exit(exit_code);
}

/// Resolves to `None` once the keyboard channel closes; pends forever
/// when keyboard control is off.
async fn next_key(keys: &mut Option<mpsc::UnboundedReceiver<KeyCommand>>) -> Option<KeyCommand> {
    match keys {
        Some(keys) => keys.recv().await,
        None => std::future::pending().await,
    }
}

/// Print operator-facing events. Signals `finished` when a recording ends
/// on its own (plan complete or device lost).
async fn print_events(mut events: EventReceiver, finished: mpsc::UnboundedSender<()>) {
    let mut battery = None;
    let mut brightness = None;

    while let Ok(event) = events.recv().await {
        match &event {
            EyecapEvent::Status(StatusEvent::BatteryLevel(level)) => {
                battery = Some(*level);
                if let Some(line) = status_summary(battery, brightness) {
                    info!("Device {}", line);
                }
            }
            EyecapEvent::Status(StatusEvent::BrightnessLevel(level)) => {
                brightness = Some(*level);
                if let Some(line) = status_summary(battery, brightness) {
                    info!("Device {}", line);
                }
            }
            EyecapEvent::Status(_) => {}
            EyecapEvent::RecordingStopped { .. } => {
                print!("{}\r\n", event.description());
                let _ = finished.send(());
            }
            _ => print!("{}\r\n", event.description()),
        }
    }
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_env("EYECAP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("eyecap={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "eyecap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Eyecap Configuration File");
    println!("# This is the default configuration with all available options.");
    println!("# A custom stage plan can be given as [[stages.plan]] tables.");
    println!();
    println!("{}", toml::to_string_pretty(&EyecapConfig::default())?);
    Ok(())
}
