mod config;
#[cfg(feature = "serve")]
mod db;
mod monitor;
mod notify;
mod process;
mod registry;
mod signals;
mod supervisor;
mod worker;

#[cfg(feature = "serve")]
mod auth;
#[cfg(feature = "serve")]
mod serve;

use clap::Parser;
use config::PanelConfig;
use monitor::LivenessMonitor;
use notify::BroadcastSink;
use registry::WorkerRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::sync::watch;

/// Notifications buffered per push subscriber before it starts lagging.
const NOTIFICATION_CAPACITY: usize = 256;

/// Web control panel that supervises the chat and messaging bots.
#[derive(Parser, Debug)]
#[command(name = "botpanel", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "panel.toml")]
    config: PathBuf,

    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (liveness ticks, push subscribers)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "botpanel=debug"
    } else {
        "botpanel=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match PanelConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    if cli.dry_run {
        println!("botpanel v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("{config:#?}");
        return;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "botpanel starting");

    let registry = Arc::new(WorkerRegistry::new(|kind| config.worker_spec(kind)));
    let sink = BroadcastSink::new(NOTIFICATION_CAPACITY);
    let supervisor = Supervisor::new(
        Arc::clone(&registry),
        Arc::new(sink.clone()),
        config.supervisor_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let monitor = LivenessMonitor::new(
        Arc::clone(&registry),
        Arc::new(sink.clone()),
        config.poll_interval(),
    )
    .spawn(shutdown_rx.clone());

    let signal_task = tokio::spawn({
        let shutdown_tx = Arc::clone(&shutdown_tx);
        async move {
            signals::shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        }
    });

    let exit_code = run(&config, &supervisor, sink, shutdown_rx).await;

    signal_task.abort();
    // The server may also return on its own after a bind or accept failure.
    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "liveness monitor task failed");
    }
    supervisor.stop_all().await;
    tracing::info!("botpanel stopped");

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

#[cfg(feature = "serve")]
async fn run(
    config: &PanelConfig,
    supervisor: &Supervisor,
    sink: BroadcastSink,
    shutdown: watch::Receiver<bool>,
) -> i32 {
    let state = serve::AppState::new(config, supervisor.clone(), sink, shutdown.clone());
    match serve::run(config, state, shutdown).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "panel server failed");
            1
        }
    }
}

#[cfg(not(feature = "serve"))]
async fn run(
    _config: &PanelConfig,
    _supervisor: &Supervisor,
    _sink: BroadcastSink,
    mut shutdown: watch::Receiver<bool>,
) -> i32 {
    tracing::info!("built without the serve feature, supervising headless");
    let _ = shutdown.wait_for(|stop| *stop).await;
    0
}
