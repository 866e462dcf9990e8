//! OpenSASE Uplink - Main Entry Point

use clap::Parser;
use opensase_uplink::backend::CommandBackend;
use opensase_uplink::config::DEFAULT_CONFIG_PATH;
use opensase_uplink::exec::CommandRunner;
use opensase_uplink::{api, PingProber, RouteProgrammer, StatusPublisher, Supervisor, UplinkConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "opensase-uplink")]
#[command(version)]
#[command(about = "Dual-WAN health monitoring and traffic steering", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "UPLINK_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Skip forwarding, NAT and firewall setup
    #[arg(long)]
    skip_init: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenSASE Uplink v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(load_config(&cli.config)?);

    let runner = CommandRunner::new(config.command_timeout());
    let backend = Arc::new(CommandBackend::new(runner));
    let programmer = Arc::new(RouteProgrammer::new(backend, config.clone()));
    let prober = Arc::new(PingProber::new(config.probe.grace()));
    let publisher = StatusPublisher::new(&config.status_path);

    if !cli.skip_init {
        // Partial setup still leaves routing worth steering
        if let Err(e) = programmer.initialize().await {
            tracing::error!(error = %e, "Initialization incomplete");
        }
    }

    let mut supervisor = Supervisor::new(config.clone(), prober, programmer, publisher);

    if cli.once {
        supervisor.run_once().await?;
        return Ok(());
    }

    let handle = supervisor.handle();

    let api_task = config.api.enabled.then(|| {
        let listen = config.api.listen;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = api::start_server(listen, handle).await {
                tracing::error!(%listen, error = %e, "API server failed");
            }
        })
    });

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Termination requested, shutting down");
        signal_handle.shutdown();
    });

    supervisor.run().await;

    if let Some(task) = api_task {
        let _ = task.await;
    }

    Ok(())
}

/// Missing file at the default location means defaults; anything else must load
fn load_config(path: &Path) -> Result<UplinkConfig, opensase_uplink::UplinkError> {
    if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
        tracing::warn!("Config not found at {}, using defaults", path.display());
        return Ok(UplinkConfig::default());
    }
    let config = UplinkConfig::load(path)?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
