//! car-relay server binary

use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use car_relay::server::parse_server_address;
use car_relay::{RelayServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "car-relay")]
#[command(about = "Relays a car's data channels to web clients over WebRTC")]
struct Cli {
    /// Show all logs (including debug)
    #[arg(long)]
    debug: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    output: Option<PathBuf>,

    /// Address to serve signaling on (e.g. http://0.0.0.0:7500)
    #[arg(long, env = "RELAY_SERVER_ADDRESS")]
    server_address: Option<String>,

    /// Only forward control commands from the active controller
    #[arg(long)]
    require_control_grant: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.debug, cli.output.as_deref()) {
        eprintln!("Could not set up logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "An unhandled error occurred, quitting");
        std::process::exit(1);
    }
    tracing::info!("Program finished");
}

fn init_tracing(debug: bool, output: Option<&Path>) -> std::io::Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match output {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
            println!("Logging to file {}", path.display());
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    tracing::debug!("Debug logs enabled");
    Ok(())
}

async fn run(cli: Cli) -> car_relay::Result<()> {
    let mut config = ServerConfig::from_env().require_control_grant(cli.require_control_grant);
    if let Some(address) = cli.server_address.as_deref() {
        config = config.bind(parse_server_address(address)?);
    }

    let server = RelayServer::new(config)?;
    server.run_until(shutdown_signal()).await
}

/// Signal that asked the server to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Interrupt,
    Terminate,
}

/// Resolves on the first interrupt or terminate. A second one of either
/// exits immediately.
async fn shutdown_signal() {
    let signal = wait_for_stop(interrupt(), terminate()).await;
    tracing::info!(signal = ?signal, "Received stop signal, gracefully shutting down server");

    tokio::spawn(async {
        let signal = wait_for_stop(interrupt(), terminate()).await;
        tracing::warn!(signal = ?signal, "Received stop signal again, forcing shutdown");
        std::process::exit(1);
    });
}

async fn wait_for_stop<I, T>(interrupt: I, terminate: T) -> StopSignal
where
    I: Future<Output = ()>,
    T: Future<Output = ()>,
{
    tokio::select! {
        _ = interrupt => StopSignal::Interrupt,
        _ = terminate => StopSignal::Terminate,
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Could not listen for interrupt signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Could not listen for terminate signal");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
