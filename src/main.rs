//! Binary entrypoint for the Scalebridge CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the agent: connect the scale, take backend
//!   commands as JSON lines on stdin, stream replies and readings on stdout
//! - `init` - create a starter `scalebridge.toml`
//! - `ports` - list serial ports with their USB identities
//! - `connect --port <path> [--timeout <s>]` - one forced connect and read, as JSON
//! - `set-port [--scale <path>] [--printer <name>]` - update the device cache
//! - `status` - print configuration, cached ports, and whether the scale is present
//!
//! See the library crate docs for module-level details: `scalebridge::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use scalebridge::config::Config;
use scalebridge::device_cache::{startup_port, DeviceCache, PortSource};
use scalebridge::instance::InstanceLock;
use scalebridge::monitor::ScaleMonitor;
use scalebridge::relay::{ClientMessage, Relay};
use scalebridge::scale::ScaleManager;
use scalebridge::serial::{self, resolve_port, SerialBackend};

#[derive(Parser)]
#[command(name = "scalebridge")]
#[command(about = "Keeps a serial weighing scale connected for the warehouse backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "scalebridge.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Start {
        /// Scale port chosen by the operator (e.g., COM4 or /dev/ttyACM0)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// List serial ports and their USB identities as JSON
    Ports,
    /// Force one connection attempt and read a single line
    Connect {
        /// Scale port
        #[arg(short, long)]
        port: String,
        /// Seconds to wait for a reading after connecting
        #[arg(short, long, default_value_t = 3)]
        timeout: u64,
    },
    /// Update the cached scale port and/or printer name
    SetPort {
        #[arg(long)]
        scale: Option<String>,
        #[arg(long)]
        printer: Option<String>,
    },
    /// Show configuration, cached ports, and device presence
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = match Config::load(&cli.config).await {
        Ok(c) => c,
        Err(e) => {
            // Ports listing and one-shot connects work without a config file
            if matches!(cli.command, Commands::Ports | Commands::Connect { .. }) {
                init_logging(&None, cli.verbose);
                warn!("{}; using defaults", e);
                Config::default()
            } else {
                return Err(e);
            }
        }
    };
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Start { port } => run_agent(config, port).await?,
        Commands::Ports => {
            let backend = system_backend()?;
            let ports =
                tokio::task::spawn_blocking(move || serial::audit(backend.as_ref())).await?;
            println!("{}", serde_json::to_string_pretty(&ports)?);
        }
        Commands::Connect { port, timeout } => {
            let backend = system_backend()?;
            let manager = Arc::new(ScaleManager::new(
                backend,
                Some(port),
                config.scale.policy()?,
            ));
            let m = manager.clone();
            let (outcome, reading) = tokio::task::spawn_blocking(move || {
                let outcome = m.connect(true);
                let reading = if outcome.is_connected() {
                    m.read_weight(Duration::from_secs(timeout))
                } else {
                    None
                };
                m.disconnect();
                (outcome, reading)
            })
            .await?;
            let ok = outcome.is_connected();
            let payload = serde_json::json!({
                "status": if ok { "ok" } else { "failed" },
                "result": outcome,
                "remedy": outcome.failure().map(|f| f.remedy()),
                "port": manager.port(),
                "reading": reading,
                "metrics": scalebridge::metrics::snapshot(),
            });
            println!("{}", payload);
            std::process::exit(if ok { 0 } else { 1 });
        }
        Commands::SetPort { scale, printer } => {
            if scale.is_none() && printer.is_none() {
                return Err(anyhow!("set-port needs --scale and/or --printer"));
            }
            let mut cache = DeviceCache::load_or_default(&config.agent.cache_file);
            if let Some(s) = scale {
                cache.scale_port = Some(s);
            }
            if let Some(p) = printer {
                cache.printer_port = Some(p);
            }
            cache.save_to_file(&config.agent.cache_file)?;
            println!("{}", serde_json::to_string_pretty(&cache)?);
        }
        Commands::Status => {
            let cache = DeviceCache::load_or_default(&config.agent.cache_file);
            let identity = config.scale.identity()?;
            let backend = system_backend()?;
            let ports = tokio::task::spawn_blocking(move || backend.enumerate()).await??;
            let present_on = identity.and_then(|id| resolve_port(id, &ports));
            let payload = serde_json::json!({
                "station_id": config.agent.station_id,
                "configured_port": config.scale.port(),
                "cached_scale_port": cache.scale_port,
                "cached_printer_port": cache.printer_port,
                "device_id": identity.map(|i| i.to_string()),
                "device_present_on": present_on,
                "ports_seen": ports.len(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}

async fn run_agent(config: Config, cli_port: Option<String>) -> Result<()> {
    info!(
        "Starting Scalebridge v{} (station {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.station_id
    );
    let _lock = InstanceLock::acquire(&config.agent.lock_file)?;

    let backend = system_backend()?;
    let audit_backend = backend.clone();
    tokio::task::spawn_blocking(move || serial::audit(audit_backend.as_ref())).await?;

    let mut cache = DeviceCache::load_or_default(&config.agent.cache_file);
    let chosen = startup_port(cli_port.as_deref(), &cache, config.scale.port());
    let manager = Arc::new(ScaleManager::new(
        backend.clone(),
        None,
        config.scale.policy()?,
    ));
    match &chosen {
        Some((port, PortSource::CommandLine)) => {
            manager.set_port(port);
            cache.scale_port = Some(port.clone());
            if let Err(e) = cache.save_to_file(&config.agent.cache_file) {
                warn!("Could not save device cache: {}", e);
            }
        }
        Some((port, source)) => {
            info!("Using scale port {} from {:?}", port, source);
            manager.apply_server_port(port);
        }
        None => info!("No scale port configured; waiting for one to be set"),
    }

    if chosen.is_some() {
        let m = manager.clone();
        let outcome = tokio::task::spawn_blocking(move || m.connect(true)).await?;
        match outcome.failure() {
            None => info!("Initial scale connect: {:?}", outcome),
            Some(reason) => warn!(
                "Scale not available at startup: {} ({}); agent continuing",
                reason,
                reason.remedy()
            ),
        }
    }

    let relay = Arc::new(
        Relay::new(manager.clone(), backend)
            .with_cache_file(&config.agent.cache_file)
            .with_printer_port(cache.printer_port.clone()),
    );

    // Single writer so stdout lines never interleave
    let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not encode message for backend: {}", e),
            }
        }
    });

    let (tx, mut rx) = mpsc::channel(64);
    let (ports_tx, mut ports_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor = ScaleMonitor::new(&config.monitor).with_port_reports(relay.clone(), ports_tx);
    let monitor_task = tokio::spawn(monitor.run(manager.clone(), tx, shutdown_rx));

    let readings_out = out_tx.clone();
    let readings = tokio::spawn(async move {
        while let Some(reading) = rx.recv().await {
            if readings_out.send(ClientMessage::weight(&reading)).await.is_err() {
                break;
            }
        }
    });
    let ports_out = out_tx.clone();
    let ports = tokio::spawn(async move {
        while let Some(report) = ports_rx.recv().await {
            if ports_out.send(ClientMessage::PortsUpdate(report)).await.is_err() {
                break;
            }
        }
    });

    let (line_tx, line_rx) = mpsc::channel(16);
    spawn_input_reader(line_tx)?;
    let commands = tokio::spawn(relay_commands(relay, line_rx, out_tx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    let summary = monitor_task.await??;
    commands.abort();
    let _ = commands.await;
    let _ = readings.await;
    let _ = ports.await;
    let _ = writer.await;

    let m = manager.clone();
    tokio::task::spawn_blocking(move || m.disconnect()).await?;

    // The relay may have rewritten the cache while running
    let mut cache = DeviceCache::load_or_default(&config.agent.cache_file);
    let last_port = manager.port();
    if last_port.is_some() && last_port != cache.scale_port {
        cache.scale_port = last_port;
        if let Err(e) = cache.save_to_file(&config.agent.cache_file) {
            warn!("Could not save device cache: {}", e);
        }
    }
    info!(
        "Stopped: {:?}, counters {:?}",
        summary,
        scalebridge::metrics::snapshot()
    );
    Ok(())
}

/// Read backend frames from stdin on a plain thread; a blocked read there
/// does not hold up runtime shutdown.
fn spawn_input_reader(lines: mpsc::Sender<String>) -> Result<()> {
    std::thread::Builder::new()
        .name("backend-input".into())
        .spawn(move || {
            use std::io::BufRead;
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(l) => {
                        if lines.blocking_send(l).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Error reading backend input: {}", e);
                        return;
                    }
                }
            }
            debug!("Backend input closed");
        })?;
    Ok(())
}

async fn relay_commands(
    relay: Arc<Relay>,
    mut lines: mpsc::Receiver<String>,
    out: mpsc::Sender<ClientMessage>,
) {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let r = relay.clone();
        let replies = match tokio::task::spawn_blocking(move || r.handle_frame(&line)).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!("Backend command handler failed: {}", e);
                continue;
            }
        };
        for reply in replies {
            if out.send(reply).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(feature = "serial")]
fn system_backend() -> Result<Arc<dyn SerialBackend>> {
    Ok(Arc::new(serial::SystemSerial::new()))
}

#[cfg(not(feature = "serial"))]
fn system_backend() -> Result<Arc<dyn SerialBackend>> {
    Err(anyhow!(
        "Serial support not compiled in. Compile with: cargo build --features serial"
    ))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match (verbosity, config) {
        (0, Some(cfg)) => cfg.logging.level_filter(),
        (0, None) => log::LevelFilter::Info,
        (1, _) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    let opened = log_file.as_ref().and_then(|file| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .ok()
    });
    if let Some(f) = opened {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
