// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use detectord::config::DetectorConfig;
use detectord::daemon::Collaborators;
use detectord::hal::{UdpTransport, UnavailableFpgaRegisters, UnavailableFrameSource};
use detectord::{null_battery_gauge, pidfile};

#[derive(Debug, Parser)]
#[command(name = "detectord", about = "X-ray flat-panel detector control daemon")]
struct Cli {
    /// Path to the detector configuration YAML file.
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match DetectorConfig::load(&cli.config_path) {
        Ok(config) => config,
        Err(e) => {
            // The subscriber isn't installed yet; a load failure this
            // early always goes to stderr.
            eprintln!("fatal: failed to load {}: {e}", cli.config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("{}", config.log_level.as_tracing_level()))
            }),
        )
        .init();

    let pid_path = pidfile::default_path();
    if let Err(e) = pidfile::write(&pid_path) {
        error!(err = %e, path = %pid_path.display(), "failed to write pid file");
        std::process::exit(1);
    }

    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone());

    let collaborators = match build_collaborators(&config) {
        Ok(collaborators) => collaborators,
        Err(e) => {
            error!(err = %e, "failed to bind network collaborators");
            pidfile::remove(&pid_path);
            std::process::exit(1);
        }
    };

    let result = detectord::run(config, collaborators, shutdown).await;
    pidfile::remove(&pid_path);

    if let Err(e) = result {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn build_collaborators(config: &DetectorConfig) -> std::io::Result<Collaborators> {
    let control_addr = SocketAddr::from(([0, 0, 0, 0], config.control_port));
    let data_addr = SocketAddr::from(([0, 0, 0, 0], 0));

    Ok(Collaborators {
        frame_source: Arc::new(UnavailableFrameSource),
        fpga: Arc::new(UnavailableFpgaRegisters),
        data_socket: Arc::new(UdpTransport::bind(data_addr)?),
        control_socket: Arc::new(UdpTransport::bind(control_addr)?),
        battery: null_battery_gauge(),
    })
}

/// `SIGTERM`/`SIGINT` trigger graceful shutdown; `SIGUSR1` is reserved
/// for an on-demand diagnostic dump. `SIGHUP` reload is handled inside
/// `daemon::run`, which owns the live config handle.
fn install_signal_handlers(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler");
        let mut sigusr1 = signal(SignalKind::user_defined1()).expect("sigusr1 handler");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                    shutdown.cancel();
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT");
                    shutdown.cancel();
                    break;
                }
                _ = sigusr1.recv() => {
                    tracing::info!("received SIGUSR1");
                }
            }
        }
    });
}
