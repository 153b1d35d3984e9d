//! Remotiq server entry point.
//!
//! Runs in two modes: the long-lived server (discovery, then connection
//! dispatch) and the internal single-plugin scan mode the server re-invokes
//! on itself to probe untrusted plugin binaries in a disposable process.

use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use remotiq_config::{config_file, crash_marker_file, registry_file, state_dir, ConfigStore};
use remotiq_plugin_db::{CrashMarker, PluginRegistry};
use remotiq_plugin_scanner::{parse_scan_argument, scan_plugin, BinaryProber, Discovery};
use remotiq_server::{Dispatcher, SessionWorker, WorkerFactory, DEFAULT_BASE_PORT};

#[derive(Debug, Parser)]
#[command(name = "remotiq-server", about = "Remotiq remote plugin host server")]
struct Cli {
    /// Scan a single plugin ("<path>|<format>") and exit; used internally
    /// for crash-isolated discovery
    #[arg(long, value_name = "PLUGIN", hide = true)]
    scan: Option<String>,

    /// Override the configured server identity
    #[arg(long)]
    id: Option<u16>,

    /// Interface to bind; an empty value binds all interfaces
    #[arg(long, default_value = "")]
    host: String,

    /// Base listen port; the server identity is added to it
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,

    /// Directory for configuration and registry documents
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let args = Cli::parse();
    let result = match args.scan.clone() {
        Some(target) => run_scan_mode(&args, &target),
        None => run_server(&args).map(|()| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn resolve_state_dir(args: &Cli) -> Result<PathBuf> {
    match &args.state_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create state directory {}", dir.display()))?;
            Ok(dir.clone())
        }
        None => state_dir().context("failed to locate the state directory"),
    }
}

/// The child half of the crash-isolation contract: exactly one
/// scan-and-persist cycle, exit code reporting the outcome.
fn run_scan_mode(args: &Cli, target: &str) -> Result<ExitCode> {
    let (path, format) =
        parse_scan_argument(target).context("invalid --scan argument, expected <path>|<format>")?;
    let dir = resolve_state_dir(args)?;
    let store = ConfigStore::new(config_file(&dir));
    let mut config = store.load();
    if let Some(id) = args.id {
        config.id = id;
    }
    let marker = CrashMarker::new(crash_marker_file(&dir, config.id));
    let success = scan_plugin(
        &registry_file(&dir, config.id),
        &marker,
        &BinaryProber,
        &path,
        format,
    )?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_server(args: &Cli) -> Result<()> {
    let dir = resolve_state_dir(args)?;
    let store = ConfigStore::new(config_file(&dir));
    let mut config = store.load();
    if let Some(id) = args.id {
        config.id = id;
    }
    info!("starting server, ID={}", config.id);

    let registry = Arc::new(PluginRegistry::open(registry_file(&dir, config.id))?);
    let marker = CrashMarker::new(crash_marker_file(&dir, config.id));
    // an unclean scan from a previous run blacklists its plugins before
    // anything else can re-probe them
    if marker.exists() {
        let recovered = marker.recover(&registry)?;
        if recovered > 0 {
            registry.save()?;
            store.save(&config)?;
        }
    }

    let config = Arc::new(Mutex::new(config));
    let mut discovery = Discovery::new(
        Arc::clone(&config),
        store,
        Arc::clone(&registry),
        marker,
    );
    discovery.isolated.args = scan_child_args(args, &dir);

    let dispatcher = Arc::new(Dispatcher::new(
        config,
        discovery,
        holding_worker_factory(),
        args.host.clone(),
        args.base_port,
    ));
    {
        let dispatcher = Arc::clone(&dispatcher);
        ctrlc::set_handler(move || dispatcher.shutdown())
            .context("failed to install the shutdown handler")?;
    }
    dispatcher.run()
}

/// Arguments forwarded to scan children so they resolve the same state
/// directory and identity as this instance.
fn scan_child_args(args: &Cli, dir: &std::path::Path) -> Vec<String> {
    let mut forwarded = vec!["--state-dir".to_string(), dir.display().to_string()];
    if let Some(id) = args.id {
        forwarded.push("--id".to_string());
        forwarded.push(id.to_string());
    }
    forwarded
}

/// Session driver that holds the connection open until the client leaves or
/// shutdown is requested.
// TODO: replace with the RemLink streaming worker once the protocol crate lands.
fn holding_worker_factory() -> WorkerFactory {
    Arc::new(|| {
        Box::new(|mut stream: TcpStream, stop: &AtomicBool| {
            let _ = stream.set_read_timeout(Some(Duration::from_millis(250)));
            let mut scratch = [0u8; 4096];
            while !stop.load(Ordering::SeqCst) {
                match stream.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err)
                        if matches!(
                            err.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) => {}
                    Err(_) => break,
                }
            }
        }) as Box<dyn SessionWorker>
    })
}
