// SPDX-License-Identifier: AGPL-3.0-only

//! stopctl - drain and stop a server over its control socket.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stopctl::{telemetry, Config, ControlListener, ControlPlane, ListenMode};
use tracing::info;

/// stopctl - out-of-band graceful stop for long-running servers
#[derive(Parser)]
#[command(name = "stopctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Control socket path (overrides STOPCTL_SOCKET)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control server until a stop request has been drained
    Server {
        /// Use the listener passed by a supervisor (LISTEN_FDS) instead of binding
        #[arg(long)]
        activation: bool,
        /// Duration of a Wait call in seconds (overrides STOPCTL_WAIT_SECS)
        #[arg(long)]
        wait_secs: Option<u64>,
    },
    /// Ask the server to drain and stop
    Stop,
    /// Issue a Wait call and block until it returns
    Wait,
    /// Run server and client in one process and stop the server
    Selftest,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    match cli.command {
        Commands::Server {
            activation,
            wait_secs,
        } => {
            if let Some(secs) = wait_secs {
                config.wait_interval = Duration::from_secs(secs);
            }
            let mode = if activation {
                ListenMode::Inherited
            } else {
                ListenMode::SelfBind
            };
            run_server(mode, &config).await
        }
        Commands::Stop => {
            stopctl::client::stop(&config.socket_path)
                .await
                .context("stop failed")?;
            info!("Client stopped");
            Ok(())
        }
        Commands::Wait => {
            stopctl::client::wait(&config.socket_path)
                .await
                .context("wait failed")?;
            info!("Wait returned");
            Ok(())
        }
        Commands::Selftest => stopctl::selftest(&config.socket_path, &config)
            .await
            .context("selftest failed"),
    }
}

async fn run_server(mode: ListenMode, config: &Config) -> Result<()> {
    info!("stopctl server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let listener = ControlListener::acquire(mode, &config.socket_path)
        .context("failed to acquire control listener")?;

    ControlPlane::start(listener, config)
        .wait_stopped()
        .await
        .context("control server failed")
}
