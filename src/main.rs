use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use camlink::client::{connect_transport, spawn_client, ClientNotice, ClientSettings};
use camlink::clock::{SharedClock, SystemClock};
use camlink::hub::{CameraActuator, CameraHub, HubSettings, ProcessActuator, SimulatedActuator};
use camlink::store::{FileStateStore, SharedStore};
use camlink::{CamlinkConfig, HubServerBuilder, KeyboardInputHandler};

#[derive(Parser, Debug)]
#[command(name = "camlink")]
#[command(about = "Shared remote camera: live view sessions and still captures")]
#[command(version)]
#[command(long_about = "Coordinates live viewing and still capture on a single remote camera \
shared by many viewers. `serve` runs the camera-side hub, `watch` runs an interactive viewer \
against a hub.")]
struct Args {
    #[command(subcommand)]
    command: Option<Mode>,

    /// Path to configuration file
    #[arg(short, long, default_value = "camlink.toml", help = "Path to TOML configuration file")]
    config: String,

    #[arg(short, long, global = true, help = "Enable debug level logging")]
    debug: bool,

    #[arg(short, long, global = true, help = "Enable verbose info level logging")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    #[arg(long, help = "Validate configuration file and exit")]
    validate_config: bool,

    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the camera-side hub and its HTTP/WebSocket server
    Serve {
        /// Use the simulated camera even when a capture command is configured
        #[arg(long)]
        simulate: bool,
    },
    /// Run an interactive viewer against a hub
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        return print_default_config();
    }

    init_logging(&args)?;

    info!("Starting camlink v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match CamlinkConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }
    if args.validate_config {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    match args.command.unwrap_or(Mode::Watch) {
        Mode::Serve { simulate } => serve(config, simulate).await,
        Mode::Watch => watch(config).await,
    }
}

async fn serve(config: CamlinkConfig, simulate: bool) -> Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);
    let store: SharedStore = Arc::new(FileStateStore::open(&config.store.path).await?);

    let mut simulated = None;
    let actuator: Arc<dyn CameraActuator> = match config.actuator.capture_command.as_deref() {
        Some(command) if !simulate => {
            info!("Capturing with `{}`", command);
            Arc::new(ProcessActuator::new(command, &config.actuator.capture_dir))
        }
        _ => {
            let actuator = Arc::new(SimulatedActuator::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.actuator.telemetry_interval(),
            ));
            actuator.start();
            simulated = Some(Arc::clone(&actuator));
            actuator
        }
    };

    let hub = CameraHub::new(store, actuator, clock, HubSettings::from(&config));
    hub.start();

    let server = Arc::new(
        HubServerBuilder::new()
            .config(config.server.clone())
            .hub(Arc::clone(&hub))
            .build()?,
    );

    let mut serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            server.stop();
            None
        }
        // Ends early only when the server fails, e.g. on a bind error
        joined = &mut serving => Some(joined),
    };
    let result = match finished {
        Some(joined) => joined?,
        None => serving.await?,
    };

    hub.stop();
    if let Some(actuator) = simulated {
        actuator.stop();
    }
    result?;

    info!("Hub shut down");
    Ok(())
}

async fn watch(config: CamlinkConfig) -> Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);
    let transport = connect_transport(&config, Arc::clone(&clock))?;
    let (client, task) = spawn_client(transport, clock, ClientSettings::from(&config));

    let keyboard = KeyboardInputHandler::new(client.clone());
    keyboard.start().await?;

    let mut notices = client.notices();
    let mut task = task;

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(notice) => report(&notice),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} notices", skipped),
                Err(RecvError::Closed) => break,
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                let _ = client.shutdown().await;
            }
            joined = &mut task => {
                if let Err(e) = joined {
                    error!("Client core failed: {}", e);
                }
                break;
            }
        }
    }

    keyboard.stop().await?;
    info!("Viewer shut down");
    Ok(())
}

fn report(notice: &ClientNotice) {
    match notice {
        ClientNotice::CaptureCompleted {
            result_ref,
            duration_ms,
        } => info!("Captured {} in {}ms", result_ref, duration_ms),
        ClientNotice::CaptureFailed { error } | ClientNotice::CaptureRejected { error } => {
            warn!("Capture did not complete: {}", error)
        }
        ClientNotice::FrameRefreshed { frame_id } => info!("Frame {}", frame_id),
        other => info!("{:?}", other),
    }
}

fn init_logging(args: &Args) -> Result<()> {
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

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("camlink={}", log_level)));

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

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Camlink Configuration File");
    println!("# Every key is optional; environment overrides use CAMLINK_<SECTION>__<KEY>");
    println!("# Set actuator.capture_command to run a real camera instead of the simulator");
    println!();
    println!("{}", CamlinkConfig::default().to_toml()?);
    Ok(())
}
