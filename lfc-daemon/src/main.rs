//! LinuxFanControl daemon (lfcd)
//!
//! Background fan-control service: discovers hwmon and GPU sensors, runs
//! user-authored control rules on a dynamic tick, publishes telemetry
//! through shared memory, and serves JSON-RPC on loopback TCP.
//!
//! # Exit codes
//! - 0: normal shutdown or successful update
//! - 1: update fetch failure or daemonization failure
//! - 2: initialisation error or missing required argument
//! - 3: no release assets during update
//! - 4: update download failed

mod daemon;
mod handlers;
mod server;
mod telemetry;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use lfc_core::config::{expand_tilde, DaemonConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const EXIT_OK: i32 = 0;
const EXIT_UPDATE_OR_DAEMONIZE: i32 = 1;
const EXIT_INIT: i32 = 2;
const EXIT_UPDATE_NO_ASSET: i32 = 3;
const EXIT_UPDATE_DOWNLOAD: i32 = 4;

// ============================================================================
// CLI
// ============================================================================

#[derive(Debug, Default, Clone)]
struct CliOptions {
    config: Option<PathBuf>,
    pidfile: Option<PathBuf>,
    logfile: Option<PathBuf>,
    profiles: Option<PathBuf>,
    profile: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    shm_path: Option<String>,
    foreground: bool,
    debug: bool,
    check_update: bool,
    update: bool,
    update_target: Option<PathBuf>,
}

fn print_help() {
    eprintln!("lfcd {} - LinuxFanControl daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    lfcd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    --config PATH         Daemon config file (daemon.json)");
    eprintln!("    --pidfile PATH        PID file location");
    eprintln!("    --logfile PATH        Log file (default: journal/stderr)");
    eprintln!("    --profiles DIR        Profiles directory");
    eprintln!("    --profile NAME        Profile to activate at startup");
    eprintln!("    --host H              RPC bind host (default 127.0.0.1)");
    eprintln!("    --port N              RPC bind port (default 8777)");
    eprintln!("    --shm_path NAME       Shared-memory telemetry object name");
    eprintln!("    --foreground          Do not daemonize");
    eprintln!("    --debug               Debug log level");
    eprintln!("    --check-update        Query the updater and exit");
    eprintln!("    --update              Run the updater and exit");
    eprintln!("    --update-target PATH  Install target for --update");
    eprintln!("    -v, --version         Print version");
    eprintln!("    -h, --help            Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    LFCD_LOG              Log filter (trace, debug, info, warn, error)");
    eprintln!("    LFCD_* / LFC_*        Config fallbacks, see daemon.json docs");
}

/// Hand-rolled argument parsing; exits with code 2 on bad usage.
fn parse_args(args: &[String]) -> CliOptions {
    let mut options = CliOptions::default();

    let mut index = 1;
    let mut take_value = |index: &mut usize, flag: &str| -> String {
        *index += 1;
        match args.get(*index) {
            Some(value) => value.clone(),
            None => {
                eprintln!("Error: {} requires an argument", flag);
                std::process::exit(EXIT_INIT);
            }
        }
    };

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(EXIT_OK);
            }
            "-v" | "--version" => {
                println!("lfcd {}", VERSION);
                std::process::exit(EXIT_OK);
            }
            "--config" => options.config = Some(expand_tilde(&take_value(&mut index, "--config"))),
            "--pidfile" => {
                options.pidfile = Some(expand_tilde(&take_value(&mut index, "--pidfile")))
            }
            "--logfile" => {
                options.logfile = Some(expand_tilde(&take_value(&mut index, "--logfile")))
            }
            "--profiles" => {
                options.profiles = Some(expand_tilde(&take_value(&mut index, "--profiles")))
            }
            "--profile" => options.profile = Some(take_value(&mut index, "--profile")),
            "--host" => options.host = Some(take_value(&mut index, "--host")),
            "--port" => {
                let raw = take_value(&mut index, "--port");
                match raw.parse() {
                    Ok(port) => options.port = Some(port),
                    Err(_) => {
                        eprintln!("Error: invalid port '{}'", raw);
                        std::process::exit(EXIT_INIT);
                    }
                }
            }
            "--shm_path" => options.shm_path = Some(take_value(&mut index, "--shm_path")),
            "--foreground" | "-f" => options.foreground = true,
            "--debug" => options.debug = true,
            "--check-update" => options.check_update = true,
            "--update" => options.update = true,
            "--update-target" => {
                options.update_target =
                    Some(expand_tilde(&take_value(&mut index, "--update-target")))
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(EXIT_INIT);
            }
        }
        index += 1;
    }
    options
}

// ============================================================================
// Update delegation
// ============================================================================

/// The release downloader ships as a separate helper; lfcd only delegates
/// to it and maps its exit codes onto the documented ones.
fn run_updater(options: &CliOptions) -> i32 {
    let mut command = Command::new("lfcd-update");
    if options.check_update {
        command.arg("--check");
    }
    if let Some(target) = &options.update_target {
        command.arg("--target").arg(target);
    }

    match command.status() {
        Ok(status) => match status.code() {
            Some(0) => EXIT_OK,
            Some(EXIT_UPDATE_NO_ASSET) => EXIT_UPDATE_NO_ASSET,
            Some(EXIT_UPDATE_DOWNLOAD) => EXIT_UPDATE_DOWNLOAD,
            _ => EXIT_UPDATE_OR_DAEMONIZE,
        },
        Err(e) => {
            eprintln!("update fetch failed: updater not available: {}", e);
            EXIT_UPDATE_OR_DAEMONIZE
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(config: &DaemonConfig) {
    let filter = std::env::var("LFCD_LOG").unwrap_or_else(|_| {
        if config.log.debug {
            "debug".to_string()
        } else {
            config.log.level.clone()
        }
    });

    if let Some(logfile) = &config.log.file {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logfile)
        {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Arc::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("cannot open logfile {}: {}", logfile.display(), e),
        }
    }

    // Journald when running under systemd, stderr otherwise.
    if Path::new("/run/systemd/journal/socket").exists() {
        if let Ok(journald_layer) = tracing_journald::layer() {
            use tracing_subscriber::prelude::*;
            tracing_subscriber::registry()
                .with(journald_layer)
                .with(tracing_subscriber::EnvFilter::new(&filter))
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ============================================================================
// PID file
// ============================================================================

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    use std::io::Write;

    // Stale PID detection: a dead owner frees the file.
    if path.exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: kill with signal 0 only checks process existence.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("another instance is running (PID {})", old_pid),
                    ));
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "could not remove PID file");
        }
    }
}

// ============================================================================
// Daemonization
// ============================================================================

/// Classic fork + setsid; the parent exits immediately.
fn daemonize() -> Result<(), String> {
    // SAFETY: fork has no preconditions; the child continues with a copy
    // of this single-threaded process (no runtime is live yet).
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(format!("fork failed: {}", std::io::Error::last_os_error()));
    }
    if pid > 0 {
        std::process::exit(EXIT_OK);
    }

    // SAFETY: setsid in the child detaches from the controlling terminal.
    if unsafe { libc::setsid() } < 0 {
        return Err(format!("setsid failed: {}", std::io::Error::last_os_error()));
    }
    let _ = std::env::set_current_dir("/");
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args);

    if options.check_update || options.update {
        std::process::exit(run_updater(&options));
    }

    // Configuration: defaults <- env <- file <- CLI.
    let mut config = match DaemonConfig::resolve(options.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(EXIT_INIT);
        }
    };
    if let Some(host) = &options.host {
        config.rpc.host = host.clone();
    }
    if let Some(port) = options.port {
        config.rpc.port = port;
    }
    if let Some(shm_path) = &options.shm_path {
        config.shm.path = shm_path.clone();
    }
    if let Some(profiles) = &options.profiles {
        config.profiles.dir = profiles.clone();
    }
    if let Some(profile) = &options.profile {
        config.profiles.active = Some(profile.clone());
    }
    if let Some(logfile) = &options.logfile {
        config.log.file = Some(logfile.clone());
    }
    if let Some(pidfile) = &options.pidfile {
        config.pid_file = Some(pidfile.clone());
    }
    if options.debug {
        config.log.debug = true;
    }

    if !options.foreground {
        if let Err(e) = daemonize() {
            eprintln!("daemonization failed: {}", e);
            std::process::exit(EXIT_UPDATE_OR_DAEMONIZE);
        }
    }

    init_logging(&config);
    info!("lfcd {} starting (pid {})", VERSION, std::process::id());

    let pid_path = config.pid_file.clone();
    if let Some(pid_path) = &pid_path {
        if let Err(e) = write_pid_file(pid_path) {
            error!(path = ?pid_path, error = %e, "cannot write PID file");
            std::process::exit(EXIT_INIT);
        }
    }

    let config_path = options
        .config
        .clone()
        .unwrap_or_else(DaemonConfig::default_config_path);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "tokio runtime init failed");
            if let Some(pid_path) = &pid_path {
                remove_pid_file(pid_path);
            }
            std::process::exit(EXIT_INIT);
        }
    };

    let outcome = runtime.block_on(async_main(config, config_path));

    if let Some(pid_path) = &pid_path {
        remove_pid_file(pid_path);
    }

    match outcome {
        Ok(restart) if restart => {
            info!("restarting");
            // Re-exec ourselves with the original argument vector.
            use std::os::unix::process::CommandExt;
            let err = Command::new(&args[0]).args(&args[1..]).exec();
            error!(error = %err, "restart exec failed");
            std::process::exit(EXIT_INIT);
        }
        Ok(_) => {
            info!("lfcd stopped");
            std::process::exit(EXIT_OK);
        }
        Err(e) => {
            error!(error = %e, "fatal");
            std::process::exit(EXIT_INIT);
        }
    }
}

async fn async_main(config: DaemonConfig, config_path: PathBuf) -> anyhow::Result<bool> {
    let mut daemon = daemon::Daemon::new(config, config_path)?;
    daemon.load_startup_profile();

    let (command_tx, command_rx) = mpsc::channel(64);

    // RPC server task; aborted once the main loop returns.
    let host = daemon.config.rpc.host.clone();
    let port = daemon.config.rpc.port;
    let server_tx = command_tx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run_server(&host, port, server_tx).await {
            error!(error = %e, "RPC server failed");
        }
    });

    // Signal handling feeds the same command queue as RPC shutdown.
    let signal_tx = command_tx.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let terminated = async {
            match &mut sigterm {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = terminated => info!("SIGTERM received"),
        }
        let _ = signal_tx
            .send(daemon::DaemonCommand::Shutdown { restart: false })
            .await;
    });

    let outcome = daemon.run(command_rx).await;
    server_handle.abort();
    Ok(outcome.restart)
}
