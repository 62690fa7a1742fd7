//! bsh-loopback-service -- stand-in for the storage service.
//!
//! Accepts the same command line the supervisor passes to the real service,
//! validates the config it is handed, binds the service and monitoring
//! ports, and stops on SIGTERM. Fault flags let tests exercise slow starts,
//! crashes, and services that ignore SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use bsh_core::service_config::ServiceConfig;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Exit status when the config is rejected.
const EXIT_CONFIG_REJECTED: u8 = 2;
/// Exit status when a port cannot be bound.
const EXIT_BIND_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "bsh-loopback-service", version, about)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long)]
    service_port: u16,

    #[arg(long)]
    monitoring_port: u16,

    /// Full service config (TOML).
    #[arg(long)]
    config: PathBuf,

    /// Storage section the service boots with (TOML).
    #[arg(long)]
    storage_config: Option<PathBuf>,

    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    in_memory_disks: bool,

    #[arg(long)]
    disk_file: Option<PathBuf>,

    #[arg(long, default_value_t = 1024)]
    disk_size_mb: u64,

    /// Wait this long before binding the ports.
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,

    /// Exit on its own after this long, simulating a crash.
    #[arg(long)]
    exit_after_ms: Option<u64>,

    /// Status used with --exit-after-ms.
    #[arg(long, default_value_t = 1)]
    exit_code: u8,

    /// Keep running after SIGTERM.
    #[arg(long)]
    ignore_sigterm: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    info!(
        pid = std::process::id(),
        log_file = ?args.log_file,
        in_memory_disks = args.in_memory_disks,
        disk_file = ?args.disk_file,
        disk_size_mb = args.disk_size_mb,
        "loopback service starting"
    );

    if let Err(e) = load_config(&args).await {
        error!(error = %e, "config rejected");
        return ExitCode::from(EXIT_CONFIG_REJECTED);
    }

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let service = match TcpListener::bind((args.host.as_str(), args.service_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = args.service_port, error = %e, "failed to bind service port");
            return ExitCode::from(EXIT_BIND_FAILED);
        }
    };
    let monitoring = match TcpListener::bind((args.host.as_str(), args.monitoring_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = args.monitoring_port, error = %e, "failed to bind monitoring port");
            return ExitCode::from(EXIT_BIND_FAILED);
        }
    };

    tokio::spawn(serve(service, b"blockstore-loopback\n"));
    tokio::spawn(serve(monitoring, b"status: ok\n"));
    info!(
        service_port = args.service_port,
        monitoring_port = args.monitoring_port,
        "service ready"
    );

    let crash = async {
        match args.exit_after_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        () = crash => {
            warn!(exit_code = args.exit_code, "simulated crash");
            ExitCode::from(args.exit_code)
        }
        () = terminated(args.ignore_sigterm) => {
            info!("shutdown signal received, stopping");
            ExitCode::SUCCESS
        }
    }
}

async fn load_config(args: &Args) -> Result<ServiceConfig, String> {
    let text = tokio::fs::read_to_string(&args.config)
        .await
        .map_err(|e| format!("{}: {e}", args.config.display()))?;
    let config = ServiceConfig::from_toml(&text).map_err(|e| e.to_string())?;
    config.validate().map_err(|e| e.to_string())?;

    if let Some(path) = &args.storage_config {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("{}: {e}", path.display()))?;
        toml::from_str::<toml::Table>(&text).map_err(|e| format!("{}: {e}", path.display()))?;
    }
    Ok(config)
}

/// Greet every connection, then close it.
async fn serve(listener: TcpListener, greeting: &'static [u8]) {
    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                if let Err(e) = stream.write_all(greeting).await {
                    tracing::debug!(%peer, error = %e, "failed to greet peer");
                }
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

/// Resolve on SIGTERM or Ctrl-C. With `ignore_sigterm`, SIGTERM is logged
/// and only Ctrl-C (or SIGKILL) ends the process.
#[cfg(unix)]
async fn terminated(ignore_sigterm: bool) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                if !ignore_sigterm {
                    return;
                }
                warn!("ignoring SIGTERM");
            }
            _ = tokio::signal::ctrl_c() => return,
        }
    }
}

#[cfg(not(unix))]
async fn terminated(_ignore_sigterm: bool) {
    let _ = tokio::signal::ctrl_c().await;
}
